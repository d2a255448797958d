use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

#[cfg(feature = "axum")]
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json},
};

/// 系统统一错误类型
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum GaiError {
    // === 业务错误 ===
    #[error("资源未找到: {resource}")]
    NotFound { resource: String },

    #[error("验证失败: {message}")]
    Validation { message: String },

    // === 外部协作方错误 ===
    #[error("向量存储错误: {operation} 失败: {message}")]
    VectorStore { operation: String, message: String },

    #[error("搜索引擎错误 ({engine}): {message}")]
    SearchEngine { engine: String, message: String },

    #[error("LLM 服务错误 ({provider}): {message}")]
    LlmService { provider: String, message: String },

    #[error("嵌入服务错误 ({provider}): {message}")]
    EmbeddingService { provider: String, message: String },

    #[error("外部服务不可用: {service}")]
    ServiceUnavailable { service: String },

    // === 流水线错误 ===
    #[error("工具执行失败 ({tool}): {message}")]
    ToolFailure { tool: String, message: String },

    #[error("流水线失败 ({stage}): {message}")]
    Pipeline { stage: String, message: String },

    // === 系统错误 ===
    #[error("配置错误: {key} - {reason}")]
    Configuration { key: String, reason: String },

    #[error("序列化错误 ({format}): {message}")]
    Serialization { format: String, message: String },

    #[error("网络错误: {operation}: {message}")]
    Network { operation: String, message: String },

    /// 超出 HTTP 客户端上配置的期限
    #[error("超时错误: {operation}: {message}")]
    Timeout { operation: String, message: String },

    #[error("Qdrant错误: {operation}: {message}")]
    QdrantError { operation: String, message: String },
}

/// 错误严重级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Low,      // 可预期的业务错误
    Medium,   // 技术错误但不影响核心功能
    High,     // 影响核心功能的错误
    Critical, // 系统级严重错误
}

/// 错误元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetadata {
    pub error_id: String,
    pub severity: ErrorSeverity,
    pub component: String,
    pub operation: Option<String>,
    pub dataset_id: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub context: std::collections::HashMap<String, String>,
}

impl GaiError {
    /// 获取错误的严重级别
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            GaiError::NotFound { .. } => ErrorSeverity::Low,
            GaiError::Validation { .. } | GaiError::ToolFailure { .. } => ErrorSeverity::Medium,
            GaiError::VectorStore { .. }
            | GaiError::SearchEngine { .. }
            | GaiError::Pipeline { .. } => ErrorSeverity::High,
            GaiError::LlmService { .. } | GaiError::EmbeddingService { .. } => {
                ErrorSeverity::Medium
            }
            GaiError::ServiceUnavailable { .. }
            | GaiError::Network { .. }
            | GaiError::Timeout { .. } => ErrorSeverity::Medium,
            GaiError::Configuration { .. } => ErrorSeverity::Critical,
            GaiError::Serialization { .. } | GaiError::QdrantError { .. } => ErrorSeverity::High,
        }
    }

    /// 外部协作方（模型、搜索、存储）不可达或返回失败
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            GaiError::Network { .. }
                | GaiError::Timeout { .. }
                | GaiError::LlmService { .. }
                | GaiError::EmbeddingService { .. }
                | GaiError::SearchEngine { .. }
                | GaiError::VectorStore { .. }
                | GaiError::ServiceUnavailable { .. }
                | GaiError::QdrantError { .. }
        )
    }

    /// 记录错误日志
    pub fn log(&self, metadata: &ErrorMetadata) {
        match metadata.severity {
            ErrorSeverity::Low => {
                warn!(
                    error_id = %metadata.error_id,
                    component = %metadata.component,
                    operation = ?metadata.operation,
                    dataset_id = ?metadata.dataset_id,
                    error = %self,
                    "business error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_id = %metadata.error_id,
                    component = %metadata.component,
                    operation = ?metadata.operation,
                    dataset_id = ?metadata.dataset_id,
                    error = %self,
                    context = ?metadata.context,
                    "technical error"
                );
            }
            ErrorSeverity::High | ErrorSeverity::Critical => {
                error!(
                    error_id = %metadata.error_id,
                    component = %metadata.component,
                    operation = ?metadata.operation,
                    dataset_id = ?metadata.dataset_id,
                    error = %self,
                    context = ?metadata.context,
                    severity = ?metadata.severity,
                    "severe error"
                );
            }
        }
    }

    /// 转换为 HTTP 状态码
    pub fn to_http_status(&self) -> u16 {
        match self {
            GaiError::NotFound { .. } => 404,
            GaiError::Validation { .. } => 400,
            GaiError::ServiceUnavailable { .. } => 503,
            GaiError::Timeout { .. } => 408,
            GaiError::LlmService { .. }
            | GaiError::EmbeddingService { .. }
            | GaiError::SearchEngine { .. }
            | GaiError::Network { .. } => 502,
            _ => 500,
        }
    }

    /// 获取用户友好的错误消息
    pub fn user_message(&self) -> String {
        match self {
            GaiError::NotFound { .. } => "请求的资源不存在".to_string(),
            GaiError::Validation { .. } => "输入数据验证失败，请检查格式".to_string(),
            GaiError::ServiceUnavailable { .. } => "服务暂时不可用，请稍后重试".to_string(),
            GaiError::Timeout { .. } => "请求超时，请重试".to_string(),
            e if e.is_transport() => "外部服务调用失败，请稍后重试".to_string(),
            _ => "系统内部错误，请联系管理员".to_string(),
        }
    }
}

/// 创建错误元数据的便捷构造器
pub struct ErrorMetadataBuilder {
    metadata: ErrorMetadata,
}

impl ErrorMetadataBuilder {
    pub fn new(component: &str) -> Self {
        Self {
            metadata: ErrorMetadata {
                error_id: uuid::Uuid::new_v4().to_string(),
                severity: ErrorSeverity::Medium,
                component: component.to_string(),
                operation: None,
                dataset_id: None,
                timestamp: chrono::Utc::now(),
                context: std::collections::HashMap::new(),
            },
        }
    }

    pub fn operation(mut self, operation: &str) -> Self {
        self.metadata.operation = Some(operation.to_string());
        self
    }

    pub fn dataset_id(mut self, dataset_id: &str) -> Self {
        self.metadata.dataset_id = Some(dataset_id.to_string());
        self
    }

    pub fn context(mut self, key: &str, value: &str) -> Self {
        self.metadata
            .context
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(mut self, error: &GaiError) -> ErrorMetadata {
        self.metadata.severity = error.severity();
        self.metadata
    }
}

pub type Result<T> = std::result::Result<T, GaiError>;

// === 转换实现 ===

impl From<serde_json::Error> for GaiError {
    fn from(err: serde_json::Error) -> Self {
        GaiError::Serialization {
            format: "json".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for GaiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GaiError::Timeout {
                operation: "http_request".to_string(),
                message: err.to_string(),
            }
        } else if err.is_connect() {
            GaiError::Network {
                operation: "connect".to_string(),
                message: err.to_string(),
            }
        } else {
            GaiError::Network {
                operation: "http_request".to_string(),
                message: err.to_string(),
            }
        }
    }
}

impl From<qdrant_client::QdrantError> for GaiError {
    fn from(err: qdrant_client::QdrantError) -> Self {
        GaiError::QdrantError {
            operation: "qdrant_client".to_string(),
            message: err.to_string(),
        }
    }
}

// Axum integration
#[cfg(feature = "axum")]
impl IntoResponse for GaiError {
    fn into_response(self) -> axum::response::Response {
        let status_code =
            StatusCode::from_u16(self.to_http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let body = serde_json::json!({
            "error": self.to_string(),
            "message": self.user_message()
        });

        (status_code, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_classified() {
        let err = GaiError::LlmService {
            provider: "ollama".into(),
            message: "status=500".into(),
        };
        assert!(err.is_transport());
        assert_eq!(err.to_http_status(), 502);

        let err = GaiError::Validation {
            message: "no columns".into(),
        };
        assert!(!err.is_transport());
        assert_eq!(err.to_http_status(), 400);
    }

    #[test]
    fn metadata_takes_severity_from_error() {
        let err = GaiError::Pipeline {
            stage: "bulk_write".into(),
            message: "boom".into(),
        };
        let meta = ErrorMetadataBuilder::new("embedding")
            .operation("run")
            .dataset_id("ds-1")
            .context("batch", "2")
            .build(&err);
        assert_eq!(meta.severity, ErrorSeverity::High);
        assert_eq!(meta.dataset_id.as_deref(), Some("ds-1"));
        assert_eq!(meta.context.get("batch").map(String::as_str), Some("2"));
    }

    #[test]
    fn service_unavailable_maps_to_503() {
        let err = GaiError::ServiceUnavailable {
            service: "hexarate".into(),
        };
        assert!(err.is_transport());
        assert_eq!(err.to_http_status(), 503);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["ServiceUnavailable"]["service"], "hexarate");
    }
}
