use sha2::{Digest, Sha256};

/// Routes `(tenant, key)` pairs onto a fixed set of shards and renders actor
/// identities of the form `g{generation}:{region}:{shard}:{primary}`.
///
/// The identity of single-use artifacts (PAR request URIs) embeds the shard,
/// so later consumption routes straight to the owning actor without a
/// directory lookup.
#[derive(Debug, Clone)]
pub struct ShardRouter {
    generation: u32,
    region: String,
    shards: usize,
}

impl ShardRouter {
    pub fn new(generation: u32, region: &str, shards: usize) -> Self {
        Self {
            generation,
            region: region.to_string(),
            shards: shards.max(1),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards
    }

    pub fn shard_for(&self, tenant: &str, key: &str) -> usize {
        let mut hasher = Sha256::new();
        hasher.update(tenant.as_bytes());
        hasher.update(b":");
        hasher.update(key.as_bytes());
        let digest = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(prefix) % self.shards as u64) as usize
    }

    pub fn identity(&self, shard: usize, primary: &str) -> String {
        format!("g{}:{}:{}:{}", self.generation, self.region, shard, primary)
    }

    /// Mint an identity for a fresh single-use artifact. The primary id is a
    /// uuid nonce; the shard is derived from `(tenant, nonce)` so load spreads
    /// even when one tenant dominates.
    pub fn mint_identity(&self, tenant: &str) -> ActorIdentity {
        let primary = uuid::Uuid::new_v4().simple().to_string();
        let shard = self.shard_for(tenant, &primary);
        ActorIdentity {
            generation: self.generation,
            region: self.region.clone(),
            shard,
            primary,
        }
    }

    pub fn parse_identity(&self, raw: &str) -> Option<ActorIdentity> {
        let mut parts = raw.splitn(4, ':');
        let generation = parts.next()?.strip_prefix('g')?.parse().ok()?;
        let region = parts.next()?.to_string();
        let shard: usize = parts.next()?.parse().ok()?;
        let primary = parts.next()?.to_string();
        if primary.is_empty() || shard >= self.shards {
            return None;
        }
        Some(ActorIdentity {
            generation,
            region,
            shard,
            primary,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorIdentity {
    pub generation: u32,
    pub region: String,
    pub shard: usize,
    pub primary: String,
}

impl ActorIdentity {
    pub fn render(&self) -> String {
        format!(
            "g{}:{}:{}:{}",
            self.generation, self.region, self.shard, self.primary
        )
    }
}
