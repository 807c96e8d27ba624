//! Authentication method selection
//!
//! Methods are tried in a fixed order: public key, then password, then
//! whatever identities a local ssh-agent publishes through
//! `SSH_AUTH_SOCK`. The first accepted method wins.

use std::sync::Arc;

use russh_keys::key::KeyPair;

use crate::client::ClientConfig;
use crate::error::{Result, TransportError};

/// One way of proving identity to the server
#[derive(Clone)]
pub enum AuthMethod {
    PublicKey(Arc<KeyPair>),
    Password(String),
    Agent,
}

impl AuthMethod {
    /// Name as reported in authentication failures
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::PublicKey(_) => "publickey",
            AuthMethod::Password(_) => "password",
            AuthMethod::Agent => "agent",
        }
    }
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Build the ordered method list for a connection.
///
/// A key that fails to decode is an error, not a silent skip.
pub fn auth_methods(config: &ClientConfig) -> Result<Vec<AuthMethod>> {
    auth_methods_with_agent(config, agent_available())
}

pub(crate) fn auth_methods_with_agent(
    config: &ClientConfig,
    agent: bool,
) -> Result<Vec<AuthMethod>> {
    let mut methods = Vec::with_capacity(3);

    if !config.key_bytes.is_empty() {
        let pem = String::from_utf8_lossy(&config.key_bytes);
        let passphrase = (!config.passphrase.is_empty()).then_some(config.passphrase.as_str());
        let key = russh_keys::decode_secret_key(&pem, passphrase)
            .map_err(|e| TransportError::Key(e.to_string()))?;
        methods.push(AuthMethod::PublicKey(Arc::new(key)));
    }

    if !config.password.is_empty() {
        methods.push(AuthMethod::Password(config.password.clone()));
    }

    if agent {
        methods.push(AuthMethod::Agent);
    }

    Ok(methods)
}

fn agent_available() -> bool {
    cfg!(unix) && std::env::var_os("SSH_AUTH_SOCK").is_some_and(|s| !s.is_empty())
}

/// Comma-joined method names for error messages
pub fn method_names(methods: &[AuthMethod]) -> String {
    methods
        .iter()
        .map(AuthMethod::name)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClientConfig {
        ClientConfig::new("10.0.0.1", 22, "root")
    }

    #[test]
    fn test_password_then_agent() {
        let mut c = config();
        c.password = "pw".into();
        let methods = auth_methods_with_agent(&c, true).unwrap();
        assert_eq!(method_names(&methods), "password,agent");
    }

    #[test]
    fn test_key_comes_first() {
        let key = KeyPair::generate_ed25519().expect("keygen");
        let mut pem = Vec::new();
        russh_keys::encode_pkcs8_pem(&key, &mut pem).unwrap();

        let mut c = config();
        c.key_bytes = pem;
        c.password = "pw".into();
        let methods = auth_methods_with_agent(&c, true).unwrap();
        assert_eq!(method_names(&methods), "publickey,password,agent");
    }

    #[test]
    fn test_garbage_key_is_an_error() {
        let mut c = config();
        c.key_bytes = b"not a key".to_vec();
        c.password = "pw".into();
        assert!(matches!(
            auth_methods_with_agent(&c, false),
            Err(TransportError::Key(_))
        ));
    }

    #[test]
    fn test_nothing_configured() {
        assert!(auth_methods_with_agent(&config(), false)
            .unwrap()
            .is_empty());
    }
}
