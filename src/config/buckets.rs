// 存储桶映射：逻辑 key -> 物理桶名
//
// 启动时构建一次，之后只读。物理桶名可通过环境变量 STORAGE_BUCKET_<KEY> 覆盖

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// 单个存储桶配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BucketConfig {
    /// 物理桶名
    pub name: String,
    /// 公开桶使用公开地址，私有桶使用签名地址
    #[serde(default = "default_public")]
    pub public: bool,
}

fn default_public() -> bool {
    true
}

impl BucketConfig {
    pub fn public(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            public: true,
        }
    }

    pub fn private(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            public: false,
        }
    }
}

/// 内置的存储桶映射
pub fn default_buckets() -> BTreeMap<String, BucketConfig> {
    [
        ("profile", BucketConfig::public("profile-images")),
        ("offers", BucketConfig::public("offer-images")),
        ("garages", BucketConfig::public("garage-images")),
        ("vendors", BucketConfig::public("vendor-images")),
        ("verification", BucketConfig::private("verification-documents")),
        ("videos", BucketConfig::public("videos")),
        ("documents", BucketConfig::private("documents")),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// 环境变量名：STORAGE_BUCKET_<KEY>
pub fn env_var_name(key: &str) -> String {
    format!(
        "STORAGE_BUCKET_{}",
        key.to_ascii_uppercase().replace('-', "_")
    )
}

/// 存储桶注册表
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketRegistry {
    buckets: BTreeMap<String, BucketConfig>,
}

impl Default for BucketRegistry {
    fn default() -> Self {
        Self::new(default_buckets())
    }
}

impl BucketRegistry {
    pub fn new(buckets: BTreeMap<String, BucketConfig>) -> Self {
        Self { buckets }
    }

    /// 内置映射 + 环境变量覆盖
    pub fn from_env(buckets: BTreeMap<String, BucketConfig>) -> Self {
        let mut registry = Self::new(buckets);
        registry.apply_overrides(|name| std::env::var(name).ok());
        registry
    }

    /// 用查找函数覆盖物理桶名（空值忽略）
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for (key, bucket) in self.buckets.iter_mut() {
            if let Some(name) = lookup(&env_var_name(key)) {
                let name = name.trim();
                if !name.is_empty() && name != bucket.name {
                    info!("存储桶 {} 被覆盖: {} -> {}", key, bucket.name, name);
                    bucket.name = name.to_string();
                }
            }
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, bucket: BucketConfig) {
        self.buckets.insert(key.into(), bucket);
    }

    /// 解析逻辑 key
    pub fn resolve(&self, key: &str) -> Option<&BucketConfig> {
        self.buckets.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.buckets.keys().map(|k| k.as_str())
    }
}
