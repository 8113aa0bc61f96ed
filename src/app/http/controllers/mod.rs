pub mod authorization_controller;
pub mod ciba_controller;
pub mod device_controller;
pub mod discovery_controller;
pub mod flow_controller;
pub mod introspection_controller;
pub mod par_controller;
pub mod token_controller;
pub mod userinfo_controller;
