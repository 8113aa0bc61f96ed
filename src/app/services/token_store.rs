use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::actor::{spawn, ActorHandle, ActorState, ShardRouter, ShardedStore};
use crate::app::error::OAuthError;
use crate::app::models::token::{AccessTokenRecord, RefreshTokenRecord};

/// Access-token active set, sharded by jti.
#[derive(Debug, Default)]
pub struct AccessTokenState {
    records: HashMap<String, AccessTokenRecord>,
}

#[derive(Clone, Debug)]
pub enum AccessTokenOp {
    Store { record: Box<AccessTokenRecord> },
    Get { jti: String },
    Revoke { jti: String },
}

#[derive(Debug)]
pub enum AccessTokenReply {
    Stored,
    Found(Box<AccessTokenRecord>),
    NotFound,
    Revoked,
}

impl ActorState for AccessTokenState {
    type Op = AccessTokenOp;
    type Reply = AccessTokenReply;

    fn apply(&mut self, op: AccessTokenOp, now: DateTime<Utc>) -> AccessTokenReply {
        match op {
            AccessTokenOp::Store { record } => {
                self.records.insert(record.jti.clone(), *record);
                AccessTokenReply::Stored
            }
            AccessTokenOp::Get { jti } => match self.records.get(&jti) {
                Some(record) if now < record.expires_at => {
                    AccessTokenReply::Found(Box::new(record.clone()))
                }
                _ => AccessTokenReply::NotFound,
            },
            AccessTokenOp::Revoke { jti } => {
                if let Some(record) = self.records.get_mut(&jti) {
                    record.revoked = true;
                }
                AccessTokenReply::Revoked
            }
        }
    }

    fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| now < r.expires_at);
        before - self.records.len()
    }
}

/// Refresh-token chains. A single writer per tenant keeps rotation and
/// family revocation linearized: consuming N+1 happens-after issuing N.
#[derive(Debug, Default)]
pub struct RefreshTokenState {
    by_token: HashMap<String, RefreshTokenRecord>,
    families: HashMap<String, Vec<String>>,
}

#[derive(Clone, Debug)]
pub enum RefreshTokenOp {
    Store {
        record: Box<RefreshTokenRecord>,
    },
    /// Atomic rotation: mark the presented token used and insert its
    /// successor in one step.
    Rotate {
        token: String,
        client_id: String,
        successor: Box<RefreshTokenRecord>,
    },
    Revoke {
        token: String,
    },
    RevokeByJti {
        jti: String,
    },
    RevokeByAccessJti {
        access_token_jti: String,
    },
    RevokeFamily {
        family_id: String,
    },
    Get {
        token: String,
    },
}

#[derive(Debug)]
pub enum RefreshTokenReply {
    Stored,
    Rotated(Box<RefreshTokenRecord>),
    /// Reuse of a rotated token: the family is revoked in the same step, and
    /// the access jtis of every member are handed back for revocation.
    ReuseDetected { access_token_jtis: Vec<String> },
    Found(Box<RefreshTokenRecord>),
    NotFound,
    Expired,
    ClientMismatch,
    Revoked { access_token_jtis: Vec<String> },
}

impl RefreshTokenState {
    fn revoke_family(&mut self, family_id: &str) -> Vec<String> {
        let mut access_jtis = Vec::new();
        if let Some(members) = self.families.get(family_id) {
            for token in members.clone() {
                if let Some(record) = self.by_token.get_mut(&token) {
                    if !record.revoked {
                        record.revoked = true;
                        access_jtis.push(record.access_token_jti.clone());
                    }
                }
            }
        }
        access_jtis
    }

    fn insert(&mut self, record: RefreshTokenRecord) {
        self.families
            .entry(record.family_id.clone())
            .or_default()
            .push(record.token.clone());
        self.by_token.insert(record.token.clone(), record);
    }
}

impl ActorState for RefreshTokenState {
    type Op = RefreshTokenOp;
    type Reply = RefreshTokenReply;

    fn apply(&mut self, op: RefreshTokenOp, now: DateTime<Utc>) -> RefreshTokenReply {
        match op {
            RefreshTokenOp::Store { record } => {
                self.insert(*record);
                RefreshTokenReply::Stored
            }
            RefreshTokenOp::Rotate {
                token,
                client_id,
                successor,
            } => {
                let record = match self.by_token.get_mut(&token) {
                    Some(r) => r,
                    None => return RefreshTokenReply::NotFound,
                };
                if record.client_id != client_id {
                    return RefreshTokenReply::ClientMismatch;
                }
                if record.revoked || record.used {
                    // Compromise signal: burn the whole family.
                    let family_id = record.family_id.clone();
                    let access_jtis = self.revoke_family(&family_id);
                    tracing::warn!(family_id = %family_id, "refresh token reuse detected, family revoked");
                    return RefreshTokenReply::ReuseDetected {
                        access_token_jtis: access_jtis,
                    };
                }
                if now >= record.expires_at {
                    return RefreshTokenReply::Expired;
                }

                record.used = true;
                let consumed = record.clone();
                self.insert(*successor);
                RefreshTokenReply::Rotated(Box::new(consumed))
            }
            RefreshTokenOp::Revoke { token } => {
                let (family_id, access_jti) = match self.by_token.get_mut(&token) {
                    Some(record) => {
                        record.revoked = true;
                        (record.family_id.clone(), record.access_token_jti.clone())
                    }
                    None => return RefreshTokenReply::NotFound,
                };
                let mut access_jtis = self.revoke_family(&family_id);
                if !access_jtis.contains(&access_jti) {
                    access_jtis.push(access_jti);
                }
                RefreshTokenReply::Revoked {
                    access_token_jtis: access_jtis,
                }
            }
            RefreshTokenOp::RevokeByJti { jti } => {
                let token = self
                    .by_token
                    .values()
                    .find(|r| r.jti == jti)
                    .map(|r| r.token.clone());
                match token {
                    Some(token) => self.apply(RefreshTokenOp::Revoke { token }, now),
                    None => RefreshTokenReply::NotFound,
                }
            }
            RefreshTokenOp::RevokeByAccessJti { access_token_jti } => {
                let token = self
                    .by_token
                    .values()
                    .find(|r| r.access_token_jti == access_token_jti)
                    .map(|r| r.token.clone());
                match token {
                    Some(token) => self.apply(RefreshTokenOp::Revoke { token }, now),
                    None => RefreshTokenReply::NotFound,
                }
            }
            RefreshTokenOp::RevokeFamily { family_id } => {
                let access_jtis = self.revoke_family(&family_id);
                RefreshTokenReply::Revoked {
                    access_token_jtis: access_jtis,
                }
            }
            RefreshTokenOp::Get { token } => match self.by_token.get(&token) {
                Some(record) => RefreshTokenReply::Found(Box::new(record.clone())),
                None => RefreshTokenReply::NotFound,
            },
        }
    }

    fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let dead: Vec<String> = self
            .by_token
            .iter()
            .filter(|(_, r)| now >= r.expires_at)
            .map(|(token, _)| token.clone())
            .collect();
        for token in &dead {
            if let Some(record) = self.by_token.remove(token) {
                if let Some(members) = self.families.get_mut(&record.family_id) {
                    members.retain(|t| t != token);
                    if members.is_empty() {
                        self.families.remove(&record.family_id);
                    }
                }
            }
        }
        dead.len()
    }
}

/// The issued-token active set: sharded access records plus the per-tenant
/// refresh chain actor.
#[derive(Clone)]
pub struct TokenStore {
    access: ShardedStore<AccessTokenState>,
    refresh: ActorHandle<RefreshTokenState>,
    tenant: String,
}

impl TokenStore {
    pub fn new(router: ShardRouter, tenant: &str) -> Self {
        Self {
            access: ShardedStore::spawn_with(router, std::time::Duration::from_secs(60), |_| {
                AccessTokenState::default()
            }),
            refresh: spawn(
                format!("g1:auto:0:refresh-{tenant}"),
                RefreshTokenState::default(),
                std::time::Duration::from_secs(60),
            ),
            tenant: tenant.to_string(),
        }
    }

    pub async fn store_access(&self, record: AccessTokenRecord) -> Result<(), OAuthError> {
        self.access
            .handle_for(&self.tenant, &record.jti)
            .call_once(AccessTokenOp::Store {
                record: Box::new(record),
            })
            .await?;
        Ok(())
    }

    pub async fn get_access(&self, jti: &str) -> Result<Option<AccessTokenRecord>, OAuthError> {
        let reply = self
            .access
            .handle_for(&self.tenant, jti)
            .call(AccessTokenOp::Get { jti: jti.to_string() })
            .await?;
        match reply {
            AccessTokenReply::Found(record) => Ok(Some(*record)),
            _ => Ok(None),
        }
    }

    pub async fn revoke_access(&self, jti: &str) -> Result<(), OAuthError> {
        self.access
            .handle_for(&self.tenant, jti)
            .call(AccessTokenOp::Revoke { jti: jti.to_string() })
            .await?;
        Ok(())
    }

    pub async fn store_refresh(&self, record: RefreshTokenRecord) -> Result<(), OAuthError> {
        self.refresh
            .call_once(RefreshTokenOp::Store {
                record: Box::new(record),
            })
            .await?;
        Ok(())
    }

    pub async fn rotate_refresh(
        &self,
        token: &str,
        client_id: &str,
        successor: RefreshTokenRecord,
    ) -> Result<RefreshTokenReply, OAuthError> {
        Ok(self
            .refresh
            .call_once(RefreshTokenOp::Rotate {
                token: token.to_string(),
                client_id: client_id.to_string(),
                successor: Box::new(successor),
            })
            .await?)
    }

    /// Revoke a refresh token (and family), cascading to the access jtis
    /// registered with each member.
    pub async fn revoke_refresh(&self, token: &str) -> Result<(), OAuthError> {
        let reply = self
            .refresh
            .call(RefreshTokenOp::Revoke {
                token: token.to_string(),
            })
            .await?;
        if let RefreshTokenReply::Revoked { access_token_jtis } = reply {
            for jti in access_token_jtis {
                self.revoke_access(&jti).await?;
            }
        }
        Ok(())
    }

    pub async fn revoke_refresh_by_jti(&self, jti: &str) -> Result<(), OAuthError> {
        let reply = self
            .refresh
            .call(RefreshTokenOp::RevokeByJti { jti: jti.to_string() })
            .await?;
        if let RefreshTokenReply::Revoked { access_token_jtis } = reply {
            for access_jti in access_token_jtis {
                self.revoke_access(&access_jti).await?;
            }
        }
        Ok(())
    }

    /// Revoke the refresh chain that issued a given access token.
    pub async fn revoke_refresh_of_access(&self, access_token_jti: &str) -> Result<(), OAuthError> {
        let reply = self
            .refresh
            .call(RefreshTokenOp::RevokeByAccessJti {
                access_token_jti: access_token_jti.to_string(),
            })
            .await?;
        if let RefreshTokenReply::Revoked { access_token_jtis } = reply {
            for jti in access_token_jtis {
                self.revoke_access(&jti).await?;
            }
        }
        Ok(())
    }

    pub async fn get_refresh(&self, token: &str) -> Result<Option<RefreshTokenRecord>, OAuthError> {
        match self
            .refresh
            .call(RefreshTokenOp::Get {
                token: token.to_string(),
            })
            .await?
        {
            RefreshTokenReply::Found(record) => Ok(Some(*record)),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn refresh(token: &str, family: &str, access_jti: &str) -> RefreshTokenRecord {
        RefreshTokenRecord {
            token: token.to_string(),
            jti: format!("{token}-jti"),
            family_id: family.to_string(),
            client_id: "c1".to_string(),
            user_id: "u1".to_string(),
            scope: "openid".to_string(),
            dpop_jkt: None,
            sid: None,
            access_token_jti: access_jti.to_string(),
            used: false,
            revoked: false,
            expires_at: Utc::now() + Duration::days(7),
        }
    }

    #[test]
    fn rotation_marks_old_and_installs_successor() {
        let mut state = RefreshTokenState::default();
        let now = Utc::now();
        state.apply(
            RefreshTokenOp::Store {
                record: Box::new(refresh("r1", "fam", "at1")),
            },
            now,
        );

        let reply = state.apply(
            RefreshTokenOp::Rotate {
                token: "r1".to_string(),
                client_id: "c1".to_string(),
                successor: Box::new(refresh("r2", "fam", "at2")),
            },
            now,
        );
        assert!(matches!(reply, RefreshTokenReply::Rotated(_)));

        // The successor is immediately rotatable.
        let reply = state.apply(
            RefreshTokenOp::Rotate {
                token: "r2".to_string(),
                client_id: "c1".to_string(),
                successor: Box::new(refresh("r3", "fam", "at3")),
            },
            now,
        );
        assert!(matches!(reply, RefreshTokenReply::Rotated(_)));
    }

    #[test]
    fn reuse_revokes_the_whole_family() {
        let mut state = RefreshTokenState::default();
        let now = Utc::now();
        state.apply(
            RefreshTokenOp::Store {
                record: Box::new(refresh("r1", "fam", "at1")),
            },
            now,
        );
        state.apply(
            RefreshTokenOp::Rotate {
                token: "r1".to_string(),
                client_id: "c1".to_string(),
                successor: Box::new(refresh("r2", "fam", "at2")),
            },
            now,
        );

        // Replaying r1 burns r2 as well.
        let reply = state.apply(
            RefreshTokenOp::Rotate {
                token: "r1".to_string(),
                client_id: "c1".to_string(),
                successor: Box::new(refresh("r3", "fam", "at3")),
            },
            now,
        );
        match reply {
            RefreshTokenReply::ReuseDetected { access_token_jtis } => {
                assert!(access_token_jtis.contains(&"at1".to_string()));
                assert!(access_token_jtis.contains(&"at2".to_string()));
            }
            other => panic!("expected reuse detection, got {:?}", other),
        }

        let reply = state.apply(
            RefreshTokenOp::Rotate {
                token: "r2".to_string(),
                client_id: "c1".to_string(),
                successor: Box::new(refresh("r4", "fam", "at4")),
            },
            now,
        );
        assert!(matches!(reply, RefreshTokenReply::ReuseDetected { .. }));
    }

    #[test]
    fn rotation_checks_client_binding() {
        let mut state = RefreshTokenState::default();
        let now = Utc::now();
        state.apply(
            RefreshTokenOp::Store {
                record: Box::new(refresh("r1", "fam", "at1")),
            },
            now,
        );
        let reply = state.apply(
            RefreshTokenOp::Rotate {
                token: "r1".to_string(),
                client_id: "other".to_string(),
                successor: Box::new(refresh("r2", "fam", "at2")),
            },
            now,
        );
        assert!(matches!(reply, RefreshTokenReply::ClientMismatch));
    }

    #[tokio::test]
    async fn revocation_cascades_to_access_records() {
        let store = TokenStore::new(ShardRouter::new(1, "auto", 2), "default");
        store
            .store_access(AccessTokenRecord {
                jti: "at1".to_string(),
                client_id: "c1".to_string(),
                user_id: Some("u1".to_string()),
                scope: "openid".to_string(),
                cnf_jkt: None,
                sid: None,
                revoked: false,
                expires_at: Utc::now() + Duration::hours(1),
            })
            .await
            .unwrap();
        store.store_refresh(refresh("r1", "fam", "at1")).await.unwrap();

        store.revoke_refresh("r1").await.unwrap();

        let access = store.get_access("at1").await.unwrap().unwrap();
        assert!(access.revoked);
        let refresh = store.get_refresh("r1").await.unwrap().unwrap();
        assert!(refresh.revoked);
    }
}
