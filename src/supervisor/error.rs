//! Supervisor 에러 타입: 전송 계층이 상태 코드와 JSON 본문을
//! 그대로 만들 수 있도록 종류별로 구분합니다.

use crate::auth::AuthError;
use crate::config::ConfigError;
use super::process::{ProcessError, SpawnError};
use super::state_machine::InstanceStatus;

#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("Instance '{0}' not found")]
    AliasNotFound(String),

    #[error("Instance '{0}' already exists")]
    AliasExists(String),

    #[error("Instance '{0}' is not running")]
    NotRunning(String),

    #[error("Instance '{alias}' cannot {operation} while {status}")]
    InvalidState {
        alias: String,
        operation: &'static str,
        status: InstanceStatus,
    },

    #[error("Failed to start '{alias}': {source}")]
    Spawn {
        alias: String,
        #[source]
        source: SpawnError,
    },

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl SupervisorError {
    pub(crate) fn from_process(alias: &str, err: ProcessError) -> Self {
        match err {
            ProcessError::NotRunning => Self::NotRunning(alias.to_string()),
            ProcessError::InputStalled => {
                Self::Internal(anyhow::anyhow!("stdin of '{}' is not accepting input", alias))
            }
        }
    }

    /// HTTP 상태 코드 매핑
    pub fn status_code(&self) -> u16 {
        match self {
            Self::AliasNotFound(_) => 404,
            Self::AliasExists(_) | Self::NotRunning(_) | Self::InvalidState { .. } => 409,
            Self::Auth(AuthError::DuplicateOwner(_)) => 409,
            Self::Spawn { .. } => 422,
            Self::Config(_) => 400,
            Self::Auth(AuthError::Unauthorized) => 401,
            Self::Auth(AuthError::Forbidden) | Self::Auth(AuthError::Permission(_)) => 403,
            Self::Auth(AuthError::KeyNotFound) => 404,
            Self::Auth(AuthError::Storage(_)) | Self::Internal(_) => 500,
        }
    }

    /// JSON 에러 응답 생성
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }

    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AliasNotFound(_) => "ALIAS_NOT_FOUND",
            Self::AliasExists(_) => "ALIAS_EXISTS",
            Self::NotRunning(_) => "NOT_RUNNING",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::Spawn { .. } => "SPAWN_FAILED",
            Self::Config(_) => "INVALID_CONFIG",
            Self::Auth(AuthError::Unauthorized) => "UNAUTHORIZED",
            Self::Auth(AuthError::Forbidden) => "FORBIDDEN",
            Self::Auth(AuthError::Permission(_)) => "PERMISSION_DENIED",
            Self::Auth(AuthError::KeyNotFound) => "KEY_NOT_FOUND",
            Self::Auth(AuthError::DuplicateOwner(_)) => "KEY_EXISTS",
            Self::Auth(AuthError::Storage(_)) => "KEY_STORAGE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}
