//! Tipos del anonimizador de identificadores.


use std::fmt;
use serde::{Serialize, Serializer};
use thiserror::Error;


pub const DIGEST_LEN: usize = 32;


#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PrivacyError {
    #[error("el secreto de anonimización no puede estar vacío")]
    EmptySecret,
}


/// Resultado de anonimizar un identificador (matrícula, VIN).
///
/// Conserva la forma normalizada solo dentro del proceso; al serializar o
/// depurar únicamente se expone el digest.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PlateHash {
    normalized: String,
    digest: [u8; DIGEST_LEN],
}


impl PlateHash {
    pub(crate) fn new(normalized: String, digest: [u8; DIGEST_LEN]) -> Self {
        Self { normalized, digest }
    }

    pub fn digest(&self) -> &[u8; DIGEST_LEN] {
        &self.digest
    }

    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.digest)
    }
}


impl fmt::Debug for PlateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlateHash").field("digest", &self.to_hex()).finish()
    }
}


impl Serialize for PlateHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}
