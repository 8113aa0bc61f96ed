pub mod auth_code;
pub mod authorization;
pub mod ciba_request;
pub mod client;
pub mod device_code;
pub mod par_request;
pub mod session;
pub mod token;

pub use auth_code::{AuthCode, AuthCodeContext};
pub use authorization::AuthorizationParams;
pub use ciba_request::{BackchannelAuthResponse, CibaDeliveryMode, CibaRequest, CibaStatus};
pub use client::{Client, TokenEndpointAuthMethod};
pub use device_code::{DeviceAuthorizationResponse, DeviceCode, DeviceGrantStatus};
pub use par_request::{ParRequest, ParResponse};
pub use session::Session;
pub use token::{AccessTokenRecord, IntrospectionResponse, RefreshTokenRecord, TokenResponse};
