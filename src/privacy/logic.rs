//! Normalización y digest con clave (HMAC-SHA256) de identificadores.
//!
//! La tabla de caracteres ambiguos se aplica después de pasar a mayúsculas:
//! `O,Q→0`, `I,L→1`, `Z→2`, `S→5`, `B→8`. Los caracteres no alfanuméricos se
//! eliminan antes.


use std::fmt;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use super::domain::{PlateHash, PrivacyError, DIGEST_LEN};


type HmacSha256 = Hmac<Sha256>;


fn substitute(c: char) -> char {
    match c {
        'O' | 'Q' => '0',
        'I' | 'L' => '1',
        'Z' => '2',
        'S' => '5',
        'B' => '8',
        other => other,
    }
}


/// Forma canónica: solo alfanuméricos, mayúsculas y tabla de sustitución.
pub fn normalize(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_uppercase)
        .map(substitute)
        .collect()
}


/// HMAC-SHA256 de la forma normalizada.
pub fn hmac(raw: &str, secret: &[u8]) -> Result<[u8; DIGEST_LEN], PrivacyError> {
    Ok(*PrivacyHasher::new(secret)?.hash(raw).digest())
}


fn into_digest(mac: HmacSha256) -> [u8; DIGEST_LEN] {
    let bytes = mac.finalize().into_bytes();
    let mut digest = [0u8; DIGEST_LEN];
    digest.copy_from_slice(&bytes);
    digest
}


/// Anonimizador con el secreto (pepper) de la instalación.
///
/// Guarda el MAC ya inicializado con la clave; cada digest parte de una copia.
#[derive(Clone)]
pub struct PrivacyHasher {
    keyed: HmacSha256,
}


impl PrivacyHasher {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, PrivacyError> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(PrivacyError::EmptySecret);
        }
        let keyed = HmacSha256::new_from_slice(secret).map_err(|_| PrivacyError::EmptySecret)?;
        Ok(Self { keyed })
    }

    pub fn hash(&self, raw: &str) -> PlateHash {
        let normalized = normalize(raw);
        let mut mac = self.keyed.clone();
        mac.update(normalized.as_bytes());
        PlateHash::new(normalized, into_digest(mac))
    }

    /// Identificador corto apto para tópicos: 16 caracteres hex del digest.
    pub fn short_id(&self, raw: &str) -> String {
        let mut hex = self.hash(raw).to_hex();
        hex.truncate(16);
        hex
    }
}


impl fmt::Debug for PrivacyHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivacyHasher").field("secret", &"<redacted>").finish()
    }
}
