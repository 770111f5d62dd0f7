// Supabase Storage REST 客户端
//
// 接口：
// - POST   {url}/storage/v1/object/{bucket}/{key}        上传（x-upsert: true，覆盖写）
// - GET    {url}/storage/v1/object/authenticated/{bucket}/{key}  读取（删除前查找分片清单）
// - DELETE {url}/storage/v1/object/{bucket}              批量删除 {"prefixes": [...]}
// - POST   {url}/storage/v1/object/sign/{bucket}/{key}   生成签名地址 {"expiresIn": ttl}
// - GET    {url}/storage/v1/object/public/{bucket}/{key} 公开访问
//
// 该服务没有服务端分片合并，finalize_multipart 在最终路径写入一个 JSON 清单，
// 清单按索引列出所有暂存分片。删除清单时同时删除它引用的暂存分片

use crate::storage::{
    encode_key, CommittedPart, ErrorKind, ObjectStore, PutOptions, PutReceipt, StoreError,
    StoreResult, STAGING_PREFIX,
};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 清单对象的 Content-Type
pub const MANIFEST_CONTENT_TYPE: &str = "application/vnd.chunk-manifest+json";

/// 分片清单
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub version: u32,
    #[serde(rename = "contentType", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(rename = "totalSize")]
    pub total_size: u64,
    pub parts: Vec<CommittedPart>,
}

#[derive(Debug, Deserialize)]
struct SignedUrlResponse {
    #[serde(rename = "signedURL", alias = "signedUrl")]
    signed_url: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(rename = "Key", alias = "key", default)]
    key: Option<String>,
    #[serde(rename = "Id", alias = "id", default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(rename = "statusCode", default)]
    status_code: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SupabaseStorage {
    client: Client,
    base_url: String,
    api_key: String,
}

impl SupabaseStorage {
    /// 创建客户端
    ///
    /// # 参数
    /// * `base_url` - 项目地址，例如 `https://xyz.supabase.co`
    /// * `api_key` - anon / service key
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> StoreResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| StoreError::new(ErrorKind::Unknown, format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self::with_client(client, base_url, api_key))
    }

    pub fn with_client(
        client: Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url,
            urlencoding::encode(bucket),
            encode_key(key)
        )
    }

    /// 读取 key 上的分片清单
    ///
    /// 对象不存在或不是清单时返回 None，只读取清单的响应体
    async fn fetch_manifest(
        &self,
        bucket: &str,
        key: &str,
    ) -> StoreResult<Option<ChunkManifest>> {
        let url = format!(
            "{}/storage/v1/object/authenticated/{}/{}",
            self.base_url,
            urlencoding::encode(bucket),
            encode_key(key)
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .header("apikey", &self.api_key)
            .send()
            .await
            .map_err(|e| map_reqwest_error("读取请求发送失败", e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check_response(response, "读取对象").await?;

        let is_manifest = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with(MANIFEST_CONTENT_TYPE))
            .unwrap_or(false);
        if !is_manifest {
            return Ok(None);
        }

        let manifest = response
            .json::<ChunkManifest>()
            .await
            .map_err(|e| map_reqwest_error("解析分片清单失败", e))?;
        Ok(Some(manifest))
    }

    async fn check_response(response: Response, context: &str) -> StoreResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<ErrorResponse>(&body)
            .ok()
            .and_then(|e| {
                let code = e.status_code.unwrap_or_default();
                e.message.or(e.error).map(|m| format!("{} {}", code, m))
            })
            .unwrap_or(body);

        let kind = ErrorKind::from_status(status.as_u16());
        error!(
            "{}失败: status={}, retriable={}, detail={}",
            context,
            status,
            kind.is_retriable(),
            detail
        );
        Err(StoreError::new(
            kind,
            format!("{}失败: HTTP {} {}", context, status.as_u16(), detail.trim()),
        ))
    }
}

/// reqwest 错误分类
fn classify_reqwest_error(e: &reqwest::Error) -> ErrorKind {
    if e.is_timeout() {
        ErrorKind::Timeout
    } else if e.is_connect() || e.is_request() || e.is_body() {
        ErrorKind::Network
    } else if let Some(status) = e.status() {
        ErrorKind::from_status(status.as_u16())
    } else if e.is_decode() {
        ErrorKind::ServerError
    } else {
        ErrorKind::Unknown
    }
}

fn map_reqwest_error(context: &str, e: reqwest::Error) -> StoreError {
    StoreError::new(classify_reqwest_error(&e), format!("{}: {}", context, e))
}

#[async_trait]
impl ObjectStore for SupabaseStorage {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        options: &PutOptions,
    ) -> StoreResult<PutReceipt> {
        let url = self.object_url(bucket, key);
        let size = data.len();
        debug!("上传对象: bucket={}, key={}, size={}", bucket, key, size);

        let mut request = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("apikey", &self.api_key)
            .header("x-upsert", "true")
            .header(
                "Content-Type",
                options
                    .content_type
                    .as_deref()
                    .unwrap_or("application/octet-stream"),
            );
        if let Some(cache_control) = &options.cache_control {
            request = request.header("cache-control", cache_control.as_str());
        }

        let response = request
            .body(data)
            .send()
            .await
            .map_err(|e| map_reqwest_error("上传请求发送失败", e))?;
        let response = Self::check_response(response, "上传对象").await?;

        let body: UploadResponse = response
            .json()
            .await
            .map_err(|e| map_reqwest_error("解析上传响应失败", e))?;
        debug!(
            "上传对象完成: key={:?}, id={:?}, size={}",
            body.key, body.id, size
        );

        Ok(PutReceipt { etag: body.id })
    }

    async fn finalize_multipart(
        &self,
        bucket: &str,
        key: &str,
        parts: &[CommittedPart],
        options: &PutOptions,
    ) -> StoreResult<()> {
        let manifest = ChunkManifest {
            version: 1,
            content_type: options.content_type.clone(),
            total_size: parts.iter().map(|p| p.size).sum(),
            parts: parts.to_vec(),
        };
        let body = serde_json::to_vec(&manifest)
            .map_err(|e| StoreError::new(ErrorKind::BadRequest, format!("序列化清单失败: {}", e)))?;

        info!(
            "写入分片清单: bucket={}, key={}, parts={}, total={} bytes",
            bucket,
            key,
            parts.len(),
            manifest.total_size
        );
        self.put_object(
            bucket,
            key,
            Bytes::from(body),
            &PutOptions::with_content_type(MANIFEST_CONTENT_TYPE),
        )
        .await?;
        Ok(())
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> StoreResult<()> {
        if keys.is_empty() {
            return Ok(());
        }

        // 合并后的对象是清单，分片仍在暂存路径下
        let mut prefixes: Vec<String> = keys.to_vec();
        for key in keys.iter().filter(|k| !k.starts_with(STAGING_PREFIX)) {
            match self.fetch_manifest(bucket, key).await {
                Ok(Some(manifest)) => {
                    debug!(
                        "对象 {} 是分片清单，一并删除 {} 个暂存分片",
                        key,
                        manifest.parts.len()
                    );
                    for part in manifest.parts {
                        if !prefixes.contains(&part.staging_key) {
                            prefixes.push(part.staging_key);
                        }
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_retriable() => return Err(e),
                Err(e) => warn!("读取分片清单失败，只删除对象本身: {}: {}", key, e),
            }
        }

        let url = format!(
            "{}/storage/v1/object/{}",
            self.base_url,
            urlencoding::encode(bucket)
        );
        let response = self
            .client
            .delete(&url)
            .bearer_auth(&self.api_key)
            .header("apikey", &self.api_key)
            .json(&serde_json::json!({ "prefixes": prefixes }))
            .send()
            .await
            .map_err(|e| map_reqwest_error("删除请求发送失败", e))?;
        Self::check_response(response, "删除对象").await?;
        debug!("已删除 {} 个对象: bucket={}", prefixes.len(), bucket);
        Ok(())
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url,
            urlencoding::encode(bucket),
            encode_key(key)
        )
    }

    async fn create_signed_url(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> StoreResult<String> {
        let url = format!(
            "{}/storage/v1/object/sign/{}/{}",
            self.base_url,
            urlencoding::encode(bucket),
            encode_key(key)
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("apikey", &self.api_key)
            .json(&serde_json::json!({ "expiresIn": ttl.as_secs() }))
            .send()
            .await
            .map_err(|e| map_reqwest_error("签名请求发送失败", e))?;
        let response = Self::check_response(response, "生成签名地址").await?;

        let body: SignedUrlResponse = response
            .json()
            .await
            .map_err(|e| map_reqwest_error("解析签名响应失败", e))?;

        // 服务端返回相对路径 /object/sign/...
        if body.signed_url.starts_with("http") {
            Ok(body.signed_url)
        } else {
            Ok(format!("{}/storage/v1{}", self.base_url, body.signed_url))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store_for(server: &MockServer) -> SupabaseStorage {
        SupabaseStorage::with_client(Client::new(), server.uri(), "anon")
    }

    fn manifest(parts: &[&str]) -> ChunkManifest {
        ChunkManifest {
            version: 1,
            content_type: Some("video/mp4".into()),
            total_size: parts.len() as u64 * 4,
            parts: parts
                .iter()
                .enumerate()
                .map(|(index, key)| CommittedPart {
                    index,
                    staging_key: key.to_string(),
                    size: 4,
                    etag: None,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_put_object_sends_upsert_and_auth_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/object/videos/u1/clip.mp4"))
            .and(header("authorization", "Bearer anon"))
            .and(header("apikey", "anon"))
            .and(header("x-upsert", "true"))
            .and(header("content-type", "video/mp4"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "Key": "videos/u1/clip.mp4", "Id": "obj-1" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let receipt = store_for(&server)
            .put_object(
                "videos",
                "u1/clip.mp4",
                Bytes::from_static(b"data"),
                &PutOptions::with_content_type("video/mp4"),
            )
            .await
            .unwrap();
        assert_eq!(receipt.etag.as_deref(), Some("obj-1"));

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests[0].body, b"data".to_vec());
    }

    #[tokio::test]
    async fn test_status_mapped_to_error_kind() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/object/b/busy"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/object/b/denied"))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "statusCode": "403",
                "error": "Unauthorized",
                "message": "new row violates row-level security policy"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/object/b/slow-down"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let store = store_for(&server);
        let put = |key: &'static str| {
            let store = store.clone();
            async move {
                store
                    .put_object("b", key, Bytes::from_static(b"x"), &PutOptions::default())
                    .await
                    .unwrap_err()
            }
        };

        let err = put("busy").await;
        assert_eq!(err.kind, ErrorKind::ServerError);
        assert!(err.is_retriable());
        assert!(err.message.contains("upstream unavailable"));

        let err = put("denied").await;
        assert_eq!(err.kind, ErrorKind::Forbidden);
        assert!(!err.is_retriable());
        assert!(err.message.contains("row-level security"));

        let err = put("slow-down").await;
        assert_eq!(err.kind, ErrorKind::RateLimited);
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_connection_refused_is_retriable() {
        // 绑定后立即释放端口，连接会被拒绝
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let uri = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let store = SupabaseStorage::with_client(Client::new(), uri, "anon");
        let err = store
            .put_object("b", "k", Bytes::from_static(b"x"), &PutOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Network);
    }

    #[tokio::test]
    async fn test_relative_signed_url_joined_to_base() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/object/sign/documents/u1/a.pdf"))
            .and(body_json(serde_json::json!({ "expiresIn": 3600 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "signedURL": "/object/sign/documents/u1/a.pdf?token=t1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let url = store_for(&server)
            .create_signed_url("documents", "u1/a.pdf", Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(
            url,
            format!(
                "{}/storage/v1/object/sign/documents/u1/a.pdf?token=t1",
                server.uri()
            )
        );
    }

    #[tokio::test]
    async fn test_absolute_signed_url_kept() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/object/sign/documents/a.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "signedUrl": "https://cdn.example.com/a.pdf?token=t2"
            })))
            .mount(&server)
            .await;

        let url = store_for(&server)
            .create_signed_url("documents", "a.pdf", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(url, "https://cdn.example.com/a.pdf?token=t2");
    }

    #[tokio::test]
    async fn test_finalize_writes_manifest_in_index_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/object/videos/u1/clip.mp4"))
            .and(header("content-type", MANIFEST_CONTENT_TYPE))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let parts = manifest(&[".staging/up1/part-00000", ".staging/up1/part-00001"]).parts;
        store_for(&server)
            .finalize_multipart(
                "videos",
                "u1/clip.mp4",
                &parts,
                &PutOptions::with_content_type("video/mp4"),
            )
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let written: ChunkManifest = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(written.version, 1);
        assert_eq!(written.total_size, 8);
        assert_eq!(written.content_type.as_deref(), Some("video/mp4"));
        assert_eq!(written.parts, parts);
    }

    #[tokio::test]
    async fn test_delete_sends_prefixes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/object/authenticated/documents/a.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(b"%PDF".to_vec(), "application/pdf"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/object/authenticated/documents/gone.pdf"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/storage/v1/object/documents"))
            .and(body_json(serde_json::json!({ "prefixes": ["a.pdf", "gone.pdf"] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(1)
            .mount(&server)
            .await;

        store_for(&server)
            .delete_objects("documents", &["a.pdf".to_string(), "gone.pdf".to_string()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_manifest_removes_staged_parts() {
        let server = MockServer::start().await;
        let body = serde_json::to_vec(&manifest(&[
            ".staging/up1/part-00000",
            ".staging/up1/part-00001",
        ]))
        .unwrap();
        Mock::given(method("GET"))
            .and(path("/storage/v1/object/authenticated/videos/u1/clip.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, MANIFEST_CONTENT_TYPE))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/storage/v1/object/videos"))
            .and(body_json(serde_json::json!({
                "prefixes": [
                    "u1/clip.mp4",
                    ".staging/up1/part-00000",
                    ".staging/up1/part-00001"
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(1)
            .mount(&server)
            .await;

        store_for(&server)
            .delete_objects("videos", &["u1/clip.mp4".to_string()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_staging_keys_skip_manifest_lookup() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/storage/v1/object/videos"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(1)
            .mount(&server)
            .await;

        store_for(&server)
            .delete_objects("videos", &[".staging/up1/part-00000".to_string()])
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method.as_str(), "DELETE");
    }

    #[tokio::test]
    async fn test_delete_fails_when_lookup_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(0)
            .mount(&server)
            .await;

        let err = store_for(&server)
            .delete_objects("videos", &["u1/clip.mp4".to_string()])
            .await
            .unwrap_err();
        assert!(err.is_retriable());
    }

    #[test]
    fn test_urls() {
        let store = SupabaseStorage::with_client(
            Client::new(),
            "https://demo.supabase.co/",
            "anon",
        );
        assert_eq!(
            store.object_url("profile-images", "u1/1_a b.jpg"),
            "https://demo.supabase.co/storage/v1/object/profile-images/u1/1_a%20b.jpg"
        );
        assert_eq!(
            store.public_url("profile-images", "u1/a.jpg"),
            "https://demo.supabase.co/storage/v1/object/public/profile-images/u1/a.jpg"
        );
    }

    #[test]
    fn test_manifest_serialization() {
        let manifest = ChunkManifest {
            version: 1,
            content_type: Some("video/mp4".into()),
            total_size: 7,
            parts: vec![CommittedPart {
                index: 0,
                staging_key: ".staging/x/part-00000".into(),
                size: 7,
                etag: None,
            }],
        };
        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["totalSize"], 7);
        assert_eq!(json["contentType"], "video/mp4");
        assert_eq!(json["parts"][0]["staging_key"], ".staging/x/part-00000");
        assert!(json["parts"][0].get("etag").is_none());
    }

    #[test]
    fn test_signed_url_response_aliases() {
        let a: SignedUrlResponse =
            serde_json::from_str(r#"{"signedURL":"/object/sign/b/k?token=t"}"#).unwrap();
        let b: SignedUrlResponse =
            serde_json::from_str(r#"{"signedUrl":"/object/sign/b/k?token=t"}"#).unwrap();
        assert_eq!(a.signed_url, b.signed_url);
    }
}
