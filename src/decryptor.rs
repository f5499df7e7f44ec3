//! Decryptor: replaces `OctoCrypt!` tokens in a rendered object, with a
//! stricter policy for `Secret` objects.

use serde_yaml::Value;
use snafu::Snafu;

use crate::crypto::CryptoContext;
use crate::value::{walk_mut, K8sObject, Visitor};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("{reason}"))]
    SkipObject { reason: String },

    #[snafu(display("decryption failed: {source}"), context(false))]
    Crypto { source: crate::crypto::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Flags controlling secret handling, mirroring the CLI's
/// `--skip-secrets`/`--deploy-plain-secrets` switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecryptPolicy {
    pub skip_secrets: bool,
    pub deploy_plain_secrets: bool,
}

/// Decrypts every token in `object` in place. Returns `Err(SkipObject)`
/// when the object must be removed from the bundle entirely (its state
/// entry should still be marked visited by the caller).
pub fn decrypt(object: &mut K8sObject, ctx: &CryptoContext, policy: DecryptPolicy) -> Result<()> {
    let is_secret = object.is_kind("Secret");

    if is_secret && policy.skip_secrets {
        return SkipObjectSnafu {
            reason: "--skip-secrets set for a Secret object".to_string(),
        }
        .fail();
    }

    if is_secret {
        decrypt_secret_maps(object, ctx, policy)?;
    }

    let mut visitor = TokenVisitor { ctx, error: None };
    walk_mut(&mut object.0, &mut visitor);
    if let Some(err) = visitor.error {
        return Err(err);
    }
    Ok(())
}

fn decrypt_secret_maps(object: &mut K8sObject, ctx: &CryptoContext, policy: DecryptPolicy) -> Result<()> {
    let Some(map) = object.as_mapping_mut() else {
        return Ok(());
    };
    for field in ["data", "stringData"] {
        let Some(Value::Mapping(values)) = map.get_mut(field) else {
            continue;
        };
        let keys: Vec<Value> = values.keys().cloned().collect();
        for key in keys {
            let Some(Value::String(s)) = values.get(&key).cloned() else {
                continue;
            };
            if CryptoContext::is_token(&s) {
                let plain = ctx.decrypt(&s)?;
                values.insert(key, Value::String(plain));
            } else if !policy.deploy_plain_secrets {
                return SkipObjectSnafu {
                    reason: "use encrypt to encrypt your secrets".to_string(),
                }
                .fail();
            }
        }
    }
    Ok(())
}

struct TokenVisitor<'a> {
    ctx: &'a CryptoContext,
    error: Option<Error>,
}

impl Visitor for TokenVisitor<'_> {
    fn visit_string(&mut self, s: &str) -> Option<Value> {
        if self.error.is_some() {
            return None;
        }
        if !CryptoContext::is_token(s) {
            return None;
        }
        match self.ctx.decrypt(s) {
            Ok(plain) => Some(Value::String(plain)),
            Err(source) => {
                self.error = Some(Error::Crypto { source });
                None
            }
        }
    }

    fn visit_mapping(&mut self, _map: &mut serde_yaml::Mapping) {}
}

impl Error {
    pub fn other(reason: impl Into<String>) -> Self {
        Error::SkipObject {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(yaml: &str) -> K8sObject {
        K8sObject::new(serde_yaml::from_str(yaml).unwrap())
    }

    #[test]
    fn decrypts_non_secret_tokens() {
        let ctx = CryptoContext::from_password("pw");
        let token = ctx.encrypt("hunter2");
        let mut obj = object(&format!("kind: ConfigMap\ndata:\n  password: \"{token}\"\n"));
        decrypt(&mut obj, &ctx, DecryptPolicy::default()).unwrap();
        assert_eq!(obj.0["data"]["password"], Value::String("hunter2".into()));
    }

    #[test]
    fn plaintext_secret_without_flag_is_skipped() {
        let ctx = CryptoContext::from_password("pw");
        let mut obj = object("kind: Secret\ndata:\n  password: plaintext\n");
        let err = decrypt(&mut obj, &ctx, DecryptPolicy::default()).unwrap_err();
        matches!(err, Error::SkipObject { .. });
    }

    #[test]
    fn plaintext_secret_allowed_with_deploy_plain_flag() {
        let ctx = CryptoContext::from_password("pw");
        let mut obj = object("kind: Secret\ndata:\n  password: plaintext\n");
        let policy = DecryptPolicy {
            deploy_plain_secrets: true,
            ..Default::default()
        };
        decrypt(&mut obj, &ctx, policy).unwrap();
        assert_eq!(obj.0["data"]["password"], Value::String("plaintext".into()));
    }

    #[test]
    fn skip_secrets_flag_always_skips_secrets() {
        let ctx = CryptoContext::from_password("pw");
        let token = ctx.encrypt("hunter2");
        let mut obj = object(&format!("kind: Secret\ndata:\n  password: \"{token}\"\n"));
        let policy = DecryptPolicy {
            skip_secrets: true,
            ..Default::default()
        };
        let err = decrypt(&mut obj, &ctx, policy).unwrap_err();
        matches!(err, Error::SkipObject { .. });
    }
}
