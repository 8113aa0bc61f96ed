use anyhow::Result;
use serde_json::json;

use crate::actor::{spawn, ActorHandle, ShardRouter};
use crate::app::services::rate_limiter::UserCodeLimiterState;
use crate::app::services::{
    AuthCodeStore, AuthorizeService, CibaService, ClientAuthService, ClientRegistry, DeviceService,
    DpopService, IntrospectionService, KeyRing, ParService, RateLimiter, SessionService,
    TokenService, TokenStore,
};
use crate::config::{Config, ConfigResolver};

/// Everything the request pipeline needs, cloned per handler. Construction
/// wires the actor stores once at boot; all handles are cheap clones.
#[derive(Clone)]
pub struct AppState {
    pub resolver: ConfigResolver,
    pub issuer: String,
    pub cookie_name: String,
    pub key_ring: KeyRing,
    pub clients: ClientRegistry,
    pub client_auth: ClientAuthService,
    pub dpop: DpopService,
    pub rate_limiter: RateLimiter,
    pub par: ParService,
    pub auth_codes: AuthCodeStore,
    pub tokens: TokenService,
    pub introspection: IntrospectionService,
    pub device: DeviceService,
    pub ciba: CibaService,
    pub sessions: SessionService,
    pub authorize: AuthorizeService,
    pub flows: crate::app::flow::FlowEngine,
    pub user_code_limiter: ActorHandle<UserCodeLimiterState>,
}

impl AppState {
    pub async fn build(config: Config) -> Result<Self> {
        let issuer = config.app.issuer.clone();
        let tenant = config.app.tenant.clone();
        let cookie_name = config.session.cookie_name.clone();
        let router = ShardRouter::new(
            config.app.shard_generation,
            &config.app.region,
            config.app.shards,
        );

        let key_ring = KeyRing::from_config(&issuer, config.oauth.signing_key_pem.as_deref())?;
        let resolver = ConfigResolver::new(config.clone());

        let clients = ClientRegistry::new();
        let client_auth = ClientAuthService::new(clients.clone(), router.clone());
        let dpop = DpopService::new(router.clone(), config.oauth.dpop_iat_skew);
        let rate_limiter = RateLimiter::new(router.clone(), resolver.clone());
        let par = ParService::new(router.clone(), resolver.clone(), &tenant);
        let auth_codes = AuthCodeStore::new(router.clone(), resolver.clone(), &tenant);
        let sessions = SessionService::new(router.clone(), &tenant, config.session.ttl_seconds);
        let device = DeviceService::new(resolver.clone(), &tenant, &issuer);
        let ciba = CibaService::new(
            &tenant,
            config.oauth.ciba_request_ttl,
            config.oauth.ciba_poll_interval,
            std::time::Duration::from_secs(config.oauth.ciba_notification_retry_delay as u64),
            config.oauth.ciba_max_notification_attempts,
            !config.app.is_production(),
        );
        let token_store = TokenStore::new(router.clone(), &tenant);
        let tokens = TokenService::new(
            key_ring.clone(),
            token_store,
            auth_codes.clone(),
            device.clone(),
            ciba.clone(),
            resolver.clone(),
        );
        let introspection = IntrospectionService::new(tokens.clone(), resolver.clone());
        let authorize = AuthorizeService::new(
            client_auth.clone(),
            par.clone(),
            auth_codes.clone(),
            sessions.clone(),
            tokens.clone(),
            key_ring.clone(),
            resolver.clone(),
            &tenant,
        );

        let flows = crate::app::flow::FlowEngine::new(router, &tenant, 900);
        flows.register_raw(default_login_flow()).await?;

        let user_code_limiter = spawn(
            format!("g1:auto:0:user-code-limiter-{tenant}"),
            UserCodeLimiterState::default(),
            std::time::Duration::from_secs(300),
        );

        Ok(Self {
            resolver,
            issuer,
            cookie_name,
            key_ring,
            clients,
            client_auth,
            dpop,
            rate_limiter,
            par,
            auth_codes,
            tokens,
            introspection,
            device,
            ciba,
            sessions,
            authorize,
            flows,
            user_code_limiter,
        })
    }
}

/// The built-in interactive login flow driven by the external form renderer.
fn default_login_flow() -> serde_json::Value {
    json!({
        "id": "login",
        "version": 2,
        "nodes": [
            {"id": "start", "type": "start"},
            {"id": "identify", "type": "identifier"},
            {"id": "login", "type": "login", "config": {"capabilities": ["password", "webauthn"]}},
            {"id": "mfa_gate", "type": "decision"},
            {"id": "mfa", "type": "mfa"},
            {"id": "done", "type": "end"},
            {"id": "failed", "type": "error", "config": {"code": "login_failed", "message": "authentication failed"}},
        ],
        "edges": [
            {"from": "start", "to": "identify", "type": "success"},
            {"from": "identify", "to": "login", "type": "success"},
            {"from": "login", "to": "mfa_gate", "type": "success"},
            {"from": "login", "to": "failed", "type": "error"},
            {"from": "mfa_gate", "to": "mfa", "type": "conditional",
             "condition": {"key": "collected.requires_mfa", "op": "isTrue"}},
            {"from": "mfa_gate", "to": "done", "type": "success"},
            {"from": "mfa", "to": "done", "type": "success"},
        ],
    })
}
