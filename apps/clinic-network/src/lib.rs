//! Serviço da rede de clínicas: parcerias entre clínicas e profissionais
//! aliados, encaminhamentos de pacientes com porta de consentimento e
//! assinaturas compartilhadas por grupo.

pub mod api;
pub mod build_info;
pub mod config;
pub mod error;
pub mod events;
pub mod network;
pub mod notify;

pub use error::{NetworkError, NetworkResult};
pub use network::NetworkService;
