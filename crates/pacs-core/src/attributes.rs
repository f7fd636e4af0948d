//! 反规范化属性blob
//!
//! 数据库中以编码后的字节保存，读取时解码；解码失败返回 `BlobCorrupted`。

use crate::error::{PacsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const PATIENT_ID: &str = "PatientID";
pub const ISSUER_OF_PATIENT_ID: &str = "IssuerOfPatientID";

/// 按DICOM关键字索引的属性集合
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes(BTreeMap<String, String>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, keyword: &str, value: &str) -> Self {
        self.set(keyword, value);
        self
    }

    pub fn set(&mut self, keyword: &str, value: &str) {
        self.0.insert(keyword.to_string(), value.to_string());
    }

    pub fn get(&self, keyword: &str) -> Option<&str> {
        self.0.get(keyword).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// 编码后的属性
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributesBlob {
    encoded: Vec<u8>,
}

impl Default for AttributesBlob {
    fn default() -> Self {
        Self {
            encoded: b"{}".to_vec(),
        }
    }
}

impl AttributesBlob {
    pub fn new(attrs: &Attributes) -> Result<Self> {
        Ok(Self {
            encoded: serde_json::to_vec(attrs)?,
        })
    }

    /// 直接包装数据库中读出的字节，不做校验
    pub fn from_encoded(encoded: Vec<u8>) -> Self {
        Self { encoded }
    }

    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    pub fn attributes(&self) -> Result<Attributes> {
        serde_json::from_slice(&self.encoded)
            .map_err(|e| PacsError::BlobCorrupted(e.to_string()))
    }
}

/// 带签发者的患者ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdWithIssuer {
    pub id: String,
    pub issuer: Option<String>,
}

impl IdWithIssuer {
    /// 从患者属性中提取ID，缺少 PatientID 时返回 None
    pub fn pid_of(attrs: &Attributes) -> Option<Self> {
        let id = attrs.get(PATIENT_ID)?.trim();
        if id.is_empty() {
            return None;
        }
        Some(Self {
            id: id.to_string(),
            issuer: attrs.get(ISSUER_OF_PATIENT_ID).map(str::to_string),
        })
    }
}

impl fmt::Display for IdWithIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.issuer {
            Some(issuer) => write!(f, "{}^^^{}", self.id, issuer),
            None => f.write_str(&self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupted_blob() {
        let blob = AttributesBlob::from_encoded(b"\x00not json".to_vec());
        assert!(matches!(blob.attributes(), Err(PacsError::BlobCorrupted(_))));
    }

    #[test]
    fn test_default_blob_decodes_empty() {
        assert!(AttributesBlob::default().attributes().unwrap().is_empty());
    }

    #[test]
    fn test_pid_of() {
        let attrs = Attributes::new()
            .with(PATIENT_ID, "P-1")
            .with(ISSUER_OF_PATIENT_ID, "HOSP");
        let blob = AttributesBlob::new(&attrs).unwrap();
        let pid = IdWithIssuer::pid_of(&blob.attributes().unwrap()).unwrap();
        assert_eq!(pid.to_string(), "P-1^^^HOSP");

        assert!(IdWithIssuer::pid_of(&Attributes::new().with(PATIENT_ID, "  ")).is_none());
    }
}
