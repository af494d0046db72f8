//! Cifragem dos snapshots de paciente e da chave de dados
//!
//! Os snapshots de paciente gravados em encaminhamentos e pedidos de
//! consentimento são cifrados com AES-256-GCM. A chave de dados é aleatória
//! e fica guardada na tabela `master_keys`, embrulhada com ChaCha20-Poly1305
//! sob uma chave derivada da frase-chave da instalação via Argon2id.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use argon2::Argon2;
use chacha20poly1305::{ChaCha20Poly1305, Key as ChaChaKey};
use chrono::Utc;
use rand::{rngs::OsRng as RandOsRng, RngCore};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::info;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::DbError;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Falha na criptografia: {0}")]
    EncryptionFailed(String),

    #[error("Falha na descriptografia: {0}")]
    DecryptionFailed(String),

    #[error("Dados inválidos: {0}")]
    InvalidData(String),

    #[error("Configuração de criptografia inválida: {0}")]
    InvalidConfiguration(String),

    #[error("Frase-chave incorreta para este banco de dados")]
    WrongKeyPhrase,
}

/// Tamanho do nonce em bytes para AES-GCM e ChaCha20-Poly1305
const NONCE_SIZE: usize = 12;

/// Tamanho do salt do Argon2id
const KDF_SALT_SIZE: usize = 16;

/// Versão atual do formato da chave embrulhada
const KEY_VERSION: i64 = 1;

/// Chave AES-256 dos snapshots; zerada ao sair de escopo
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        RandOsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Exige exatamente 32 bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidData(format!(
                "A chave deve ter 32 bytes, recebeu {}",
                bytes.len()
            )));
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(**)")
    }
}

/// Texto cifrado e nonce, gravados em colunas separadas
#[derive(Debug, Clone)]
pub struct EncryptedData {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
}

/// AES-256-GCM com nonce aleatório
pub fn encrypt(data: &[u8], key: &EncryptionKey) -> Result<EncryptedData, CryptoError> {
    let aes_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(aes_key);

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, data)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    Ok(EncryptedData {
        ciphertext,
        nonce: nonce.to_vec(),
    })
}

pub fn decrypt(encrypted: &EncryptedData, key: &EncryptionKey) -> Result<Vec<u8>, CryptoError> {
    let aes_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(aes_key);

    if encrypted.nonce.len() != NONCE_SIZE {
        return Err(CryptoError::InvalidData(format!(
            "Nonce inválido: esperado {} bytes, recebido {}",
            NONCE_SIZE,
            encrypted.nonce.len()
        )));
    }

    let nonce = Nonce::from_slice(&encrypted.nonce);

    cipher
        .decrypt(nonce, encrypted.ciphertext.as_ref())
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

/// Deriva a chave de embrulho a partir da frase-chave usando Argon2id
pub fn derive_wrapping_key(key_phrase: &str, salt: &[u8]) -> Result<EncryptionKey, CryptoError> {
    if key_phrase.is_empty() {
        return Err(CryptoError::InvalidConfiguration(
            "key_phrase vazia; defina uma frase-chave explicitamente".to_string(),
        ));
    }

    let mut derived = [0u8; 32];
    Argon2::default()
        .hash_password_into(key_phrase.as_bytes(), salt, &mut derived)
        .map_err(|e| CryptoError::InvalidConfiguration(e.to_string()))?;

    let key = EncryptionKey(derived);
    derived.zeroize();
    Ok(key)
}

/// Embrulha a chave de dados com ChaCha20-Poly1305 sob a chave derivada da frase
pub fn wrap_key(
    key: &EncryptionKey,
    key_phrase: &str,
    salt: &[u8],
) -> Result<EncryptedData, CryptoError> {
    let wrapping_key = derive_wrapping_key(key_phrase, salt)?;
    let cipher = ChaCha20Poly1305::new(ChaChaKey::from_slice(wrapping_key.as_bytes()));

    let mut nonce = [0u8; NONCE_SIZE];
    RandOsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(nonce.as_ref().into(), key.as_bytes())
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    Ok(EncryptedData {
        ciphertext,
        nonce: nonce.to_vec(),
    })
}

/// Frase errada resulta em `WrongKeyPhrase`
pub fn unwrap_key(
    encrypted: &EncryptedData,
    key_phrase: &str,
    salt: &[u8],
) -> Result<EncryptionKey, CryptoError> {
    let wrapping_key = derive_wrapping_key(key_phrase, salt)?;
    let cipher = ChaCha20Poly1305::new(ChaChaKey::from_slice(wrapping_key.as_bytes()));

    if encrypted.nonce.len() != NONCE_SIZE {
        return Err(CryptoError::InvalidData(format!(
            "Nonce inválido: esperado {} bytes, recebido {}",
            NONCE_SIZE,
            encrypted.nonce.len()
        )));
    }

    let plaintext = cipher
        .decrypt(encrypted.nonce.as_slice().into(), encrypted.ciphertext.as_ref())
        .map_err(|_| CryptoError::WrongKeyPhrase)?;

    EncryptionKey::from_bytes(&plaintext)
}

/// Carrega a chave de dados ativa, criando-a na primeira execução
pub async fn load_or_create_master_key(
    pool: &SqlitePool,
    key_phrase: &str,
) -> Result<EncryptionKey, DbError> {
    let row = sqlx::query(
        "SELECT kdf_salt, wrapped_key_ciphertext, wrapped_key_nonce \
         FROM master_keys WHERE active = 1 ORDER BY id DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;

    if let Some(row) = row {
        let salt: Vec<u8> = row.try_get("kdf_salt")?;
        let wrapped = EncryptedData {
            ciphertext: row.try_get("wrapped_key_ciphertext")?,
            nonce: row.try_get("wrapped_key_nonce")?,
        };
        return Ok(unwrap_key(&wrapped, key_phrase, &salt)?);
    }

    let mut salt = [0u8; KDF_SALT_SIZE];
    RandOsRng.fill_bytes(&mut salt);
    let key = EncryptionKey::generate();
    let wrapped = wrap_key(&key, key_phrase, &salt)?;

    sqlx::query(
        "INSERT INTO master_keys (created_at, active, kdf_salt, wrapped_key_ciphertext, \
         wrapped_key_nonce, key_version) VALUES (?, 1, ?, ?, ?, ?)",
    )
    .bind(Utc::now())
    .bind(salt.as_slice())
    .bind(&wrapped.ciphertext)
    .bind(&wrapped.nonce)
    .bind(KEY_VERSION)
    .execute(pool)
    .await?;

    info!("Nova chave de dados criada (versão {})", KEY_VERSION);
    Ok(key)
}
