#![doc = include_str!("../README.md")]

pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod guard;
pub mod otp;
pub mod password;
pub mod token;
pub mod types;

// Re-exports for convenient access
pub use client::OtpClient;
pub use config::ClientConfig;
pub use error::{Error, FieldError};
pub use gateway::{ApiClient, ApiOutcome, ClientError, Unreachable};
pub use guard::{AuthStatus, LoginOutcome, SessionGuard};
pub use otp::{
    ConfigView, Countdown, CountdownEvent, GenerationController, GenerationOptions,
    GenerationState, OtpBackend, ValidationController, ValidationRequest, ValidationState,
};
pub use password::{check_new_user, check_password, password_problems};
#[cfg(feature = "persist")]
pub use token::FileSessionStorage;
pub use token::{MemorySessionStorage, Session, SessionStorage, TokenStore};
pub use types::{
    AuditLogEntry, AuditStatus, BulkGenerateItem, BulkGenerateResult, ConfigId, NewOtpConfig,
    NewUser, OtpAlgorithm, OtpConfig, OtpGenerationResult, OtpSecret, OtpType, UserId,
    UserProfile, ValidationResult,
};
