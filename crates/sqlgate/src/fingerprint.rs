//! Pool fingerprints
//!
//! A fingerprint covers exactly the descriptor fields that change how a
//! connection is established. `read_only` and `description` are excluded:
//! the access mode is chosen per transaction, so flipping it reuses the pool.

use sha2::{Digest, Sha256};
use sqlgate_rdbc::tls::TlsMode;
use std::fmt;
use std::path::Path;

use crate::config::{ConnectionDescriptor, Target};

/// SHA-256 over a descriptor's connection-relevant fields
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PoolFingerprint([u8; 32]);

impl PoolFingerprint {
    /// Compute the fingerprint of a descriptor
    pub fn of(descriptor: &ConnectionDescriptor) -> Self {
        let mut hasher = Sha256::new();

        match &descriptor.target {
            Target::Url(url) => {
                field(&mut hasher, b"url", url.expose_secret().as_bytes());
            }
            Target::Params {
                host,
                port,
                user,
                password,
                database,
            } => {
                field(&mut hasher, b"host", host.as_bytes());
                field(&mut hasher, b"port", &port.to_be_bytes());
                opt(&mut hasher, b"user", user.as_deref().map(str::as_bytes));
                opt(
                    &mut hasher,
                    b"password",
                    password.as_ref().map(|p| p.expose_secret().as_bytes()),
                );
                opt(&mut hasher, b"database", database.as_deref().map(str::as_bytes));
            }
        }

        field(&mut hasher, b"tls", descriptor.tls.as_str().as_bytes());
        if let TlsMode::Verify(verify) = &descriptor.tls {
            path(&mut hasher, b"ca", verify.ca_cert_path.as_deref());
            path(&mut hasher, b"cert", verify.client_cert_path.as_deref());
            path(&mut hasher, b"key", verify.client_key_path.as_deref());
        }

        field(
            &mut hasher,
            b"pool_size",
            &(descriptor.pool_size as u64).to_be_bytes(),
        );

        Self(hasher.finalize().into())
    }

    /// Lowercase hex form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 12 hex digits, for logs
    pub fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(12);
        hex
    }
}

impl fmt::Debug for PoolFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PoolFingerprint({})", self.short())
    }
}

impl fmt::Display for PoolFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short())
    }
}

// length-prefixed so adjacent fields cannot run together
fn field(hasher: &mut Sha256, name: &[u8], value: &[u8]) {
    hasher.update((name.len() as u32).to_be_bytes());
    hasher.update(name);
    hasher.update((value.len() as u64).to_be_bytes());
    hasher.update(value);
}

fn opt(hasher: &mut Sha256, name: &[u8], value: Option<&[u8]>) {
    match value {
        Some(value) => {
            hasher.update([1u8]);
            field(hasher, name, value);
        }
        None => {
            hasher.update([0u8]);
            field(hasher, name, &[]);
        }
    }
}

fn path(hasher: &mut Sha256, name: &[u8], value: Option<&Path>) {
    opt(
        hasher,
        name,
        value.map(|p| p.as_os_str().as_encoded_bytes()),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SensitiveString;
    use sqlgate_rdbc::tls::TlsVerify;

    fn descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor {
            label: "staging".into(),
            target: Target::Params {
                host: "db".into(),
                port: 5432,
                user: Some("reader".into()),
                password: Some(SensitiveString::new("pw")),
                database: Some("app".into()),
            },
            tls: TlsMode::Disable,
            read_only: true,
            pool_size: 5,
            description: None,
        }
    }

    #[test]
    fn test_stable_for_equal_descriptors() {
        assert_eq!(PoolFingerprint::of(&descriptor()), PoolFingerprint::of(&descriptor()));
        assert_eq!(PoolFingerprint::of(&descriptor()).to_hex().len(), 64);
    }

    #[test]
    fn test_ignores_access_mode_and_description() {
        let mut other = descriptor();
        other.read_only = false;
        other.description = Some("replica".into());
        other.label = "renamed".into();
        assert_eq!(PoolFingerprint::of(&descriptor()), PoolFingerprint::of(&other));
    }

    #[test]
    fn test_connection_fields_change_fingerprint() {
        let base = PoolFingerprint::of(&descriptor());

        let mut d = descriptor();
        d.pool_size = 6;
        assert_ne!(base, PoolFingerprint::of(&d));

        let mut d = descriptor();
        d.tls = TlsMode::Insecure;
        assert_ne!(base, PoolFingerprint::of(&d));

        let mut d = descriptor();
        if let Target::Params { password, .. } = &mut d.target {
            *password = Some(SensitiveString::new("rotated"));
        }
        assert_ne!(base, PoolFingerprint::of(&d));

        let mut d = descriptor();
        d.tls = TlsMode::Verify(TlsVerify {
            ca_cert_path: Some("/ca.pem".into()),
            ..Default::default()
        });
        let verified = PoolFingerprint::of(&d);
        d.tls = TlsMode::Verify(TlsVerify::default());
        assert_ne!(verified, PoolFingerprint::of(&d));
    }

    #[test]
    fn test_absent_and_empty_user_differ() {
        let mut a = descriptor();
        let mut b = descriptor();
        if let Target::Params { user, .. } = &mut a.target {
            *user = None;
        }
        if let Target::Params { user, .. } = &mut b.target {
            *user = Some(String::new());
        }
        assert_ne!(PoolFingerprint::of(&a), PoolFingerprint::of(&b));
    }
}
