// proxy 模块 - OpenAI 兼容网关
pub mod config;
pub mod error;
pub mod token_signer;
pub mod client;
pub mod converter;
pub mod model_mapper;
pub mod image_uploader;
pub mod stream_converter;
pub mod retry_handler;
pub mod server;

pub use config::{Credential, GatewayConfig};
pub use error::GatewayError;
pub use token_signer::TokenSigner;
pub use client::UpstreamClient;
pub use image_uploader::ImageUploader;
pub use model_mapper::ModelMapper;
pub use retry_handler::RetryOrchestrator;
pub use stream_converter::SseTranscoder;
pub use server::{build_router, AppState, AxumServer};
