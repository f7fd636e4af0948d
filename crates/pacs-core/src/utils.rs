//! 通用工具函数

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// 多值字段的分隔符
pub const DELIMITER: char = '\\';

/// 生成唯一的DICOM标识符
pub fn generate_dicom_uid() -> String {
    format!("{}.{}.{}",
        "2.25",
        Uuid::new_v4().as_u128(),
        Utc::now().timestamp()
    )
}

/// 验证DICOM UID格式
pub fn is_valid_dicom_uid(uid: &str) -> bool {
    !uid.is_empty() && uid.len() <= 64 && uid.chars().all(|c| c.is_ascii_digit() || c == '.')
}

/// 用反斜杠连接多个值，截断到 `max_len` 个字符以内且不截断单个值
pub fn join_bounded<S: AsRef<str>>(values: &[S], max_len: usize) -> String {
    let mut joined = String::new();
    for value in values {
        let value = value.as_ref();
        let extra = if joined.is_empty() { value.len() } else { value.len() + 1 };
        if joined.len() + extra > max_len {
            break;
        }
        if !joined.is_empty() {
            joined.push(DELIMITER);
        }
        joined.push_str(value);
    }
    joined
}

/// 检查所在存储ID集合：排序、去重，以反斜杠连接保存
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageIds(BTreeSet<String>);

impl StorageIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// 解析数据库中的编码值，`None` 或空串表示空集合
    pub fn decode(encoded: Option<&str>) -> Self {
        Self(
            encoded
                .unwrap_or_default()
                .split(DELIMITER)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    /// 空集合编码为 `None`
    pub fn encode(&self) -> Option<String> {
        if self.0.is_empty() {
            return None;
        }
        Some(self.0.iter().map(String::as_str).collect::<Vec<_>>().join("\\"))
    }

    /// 加入一个存储ID，编码值发生变化时返回 true
    pub fn add(&mut self, storage_id: &str) -> bool {
        self.0.insert(storage_id.to_string())
    }

    pub fn remove(&mut self, storage_id: &str) -> bool {
        self.0.remove(storage_id)
    }

    pub fn contains(&self, storage_id: &str) -> bool {
        self.0.contains(storage_id)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: AsRef<str>> FromIterator<S> for StorageIds {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(|s| s.as_ref().to_string()).collect())
    }
}

impl fmt::Display for StorageIds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_dicom_uid() {
        let uid = generate_dicom_uid();
        assert!(is_valid_dicom_uid(&uid), "{}", uid);
    }

    #[test]
    fn test_is_valid_dicom_uid() {
        assert!(is_valid_dicom_uid("1.2.840.10008.5.1.4.1.1.4"));
        assert!(!is_valid_dicom_uid(""));
        assert!(!is_valid_dicom_uid("invalid.uid.with.letters"));
    }

    #[test]
    fn test_storage_ids_sorted_and_deduplicated() {
        let mut ids = StorageIds::decode(Some("fs2"));
        assert!(ids.add("fs1"));
        assert!(!ids.add("fs2"));
        assert!(ids.add("cloud"));
        assert_eq!(ids.encode().as_deref(), Some("cloud\\fs1\\fs2"));
        assert_eq!(StorageIds::decode(ids.encode().as_deref()), ids);
    }

    #[test]
    fn test_empty_storage_ids_encode_to_none() {
        assert_eq!(StorageIds::new().encode(), None);
        assert!(StorageIds::decode(None).is_empty());
        assert!(StorageIds::decode(Some("")).is_empty());
    }

    #[test]
    fn test_join_bounded() {
        let uids = ["1.2.3", "1.2.4", "1.2.5"];
        assert_eq!(join_bounded(&uids, 100), "1.2.3\\1.2.4\\1.2.5");
        assert_eq!(join_bounded(&uids, 11), "1.2.3\\1.2.4");
        assert_eq!(join_bounded(&uids, 4), "");
    }
}
