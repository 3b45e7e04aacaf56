use serde::Serialize;

/// Raw credential row; secret fields are hex-encoded ciphertext.
#[derive(Debug, Clone)]
pub struct CredentialRow {
    pub id: i64,
    pub name: String,
    pub username: String,
    pub password_encrypted: Option<String>,
    pub private_key_encrypted: Option<String>,
    pub key_passphrase_encrypted: Option<String>,
    pub is_default: bool,
}

/// Credential metadata safe to show without unlocking the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialInfo {
    pub id: i64,
    pub name: String,
    pub username: String,
    pub is_default: bool,
    pub has_password: bool,
    pub has_private_key: bool,
}
