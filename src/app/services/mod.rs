pub mod auth_code_store;
pub mod authorize_service;
pub mod ciba_service;
pub mod client_auth_service;
pub mod client_registry;
pub mod crypto;
pub mod device_service;
pub mod dpop_service;
pub mod introspection_service;
pub mod jwk;
pub mod key_ring;
pub mod par_service;
pub mod pkce;
pub mod rate_limiter;
pub mod session_service;
pub mod token_service;
pub mod token_store;

pub use auth_code_store::AuthCodeStore;
pub use authorize_service::{AuthorizeOutcome, AuthorizeService};
pub use ciba_service::CibaService;
pub use client_auth_service::ClientAuthService;
pub use client_registry::ClientRegistry;
pub use device_service::DeviceService;
pub use dpop_service::DpopService;
pub use introspection_service::IntrospectionService;
pub use key_ring::KeyRing;
pub use par_service::ParService;
pub use rate_limiter::RateLimiter;
pub use session_service::SessionService;
pub use token_service::TokenService;
pub use token_store::TokenStore;
