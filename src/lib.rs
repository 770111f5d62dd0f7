// Media Upload Engine
// 分片媒体上传核心库：图片压缩、分片、重试、并发传输、上传门面

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 对象存储接口与实现
pub mod storage;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use config::{AppConfig, BucketConfig, BucketRegistry};
pub use storage::{
    ErrorKind, LocalObjectStore, MemoryObjectStore, ObjectStore, StoreError, SupabaseStorage,
};
pub use uploader::{
    ProgressCallback, TransferError, UploadError, UploadFile, UploadOptions, UploadProgress,
    UploadResult, UploadService, UploadSettings, UploadStage, UploadStatus,
};
