//! TTL-gated model metadata cache with a static fallback list.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use kiro_core::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub id: String,
    pub max_input_tokens: u32,
    /// Informational; surfaced in synthesized usage only.
    pub default_credits_used: f64,
}

struct CacheState {
    models: HashMap<String, ModelInfo>,
    /// Listing order, for `all_ids`.
    order: Vec<String>,
    refreshed_at: Option<Instant>,
    /// Set when the static fallback is being served.
    fallback: bool,
    /// Bumped on every install; lets waiting refills detect a completed one.
    generation: u64,
}

pub struct ModelCache {
    inner: RwLock<CacheState>,
    /// Coalesces concurrent refills: first miss runs the fetch, the rest
    /// wait here and observe the bumped generation.
    refill: Mutex<()>,
    ttl: Duration,
    default_max_input_tokens: u32,
}

impl ModelCache {
    pub fn new(ttl_secs: u64, default_max_input_tokens: u32) -> Self {
        Self {
            inner: RwLock::new(CacheState {
                models: HashMap::new(),
                order: Vec::new(),
                refreshed_at: None,
                fallback: false,
                generation: 0,
            }),
            refill: Mutex::new(()),
            ttl: Duration::from_secs(ttl_secs),
            default_max_input_tokens,
        }
    }

    pub fn get(&self, model_id: &str) -> Option<ModelInfo> {
        self.read().models.get(model_id).cloned()
    }

    pub fn get_max_input_tokens(&self, model_id: &str) -> u32 {
        self.get(model_id)
            .map(|m| m.max_input_tokens)
            .unwrap_or(self.default_max_input_tokens)
    }

    pub fn all_ids(&self) -> Vec<String> {
        self.read().order.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.read().models.is_empty()
    }

    /// Stale means: never filled, TTL elapsed, or serving the fallback list.
    pub fn is_stale(&self) -> bool {
        let state = self.read();
        state.fallback
            || state
                .refreshed_at
                .map(|at| at.elapsed() > self.ttl)
                .unwrap_or(true)
    }

    /// Atomic replacement; readers never observe a half-populated map.
    pub fn update(&self, records: Vec<ModelInfo>) {
        self.install(records, false);
    }

    fn install(&self, records: Vec<ModelInfo>, fallback: bool) {
        let order: Vec<String> = records.iter().map(|m| m.id.clone()).collect();
        let models = records.into_iter().map(|m| (m.id.clone(), m)).collect();
        let mut state = self.write();
        state.models = models;
        state.order = order;
        state.refreshed_at = Some(Instant::now());
        state.fallback = fallback;
        state.generation += 1;
    }

    /// Refill the cache if it is empty or stale, coalescing with concurrent
    /// callers. `fetch` is only invoked by the caller that wins the refill
    /// slot; a failed fetch installs the static fallback so the catalog
    /// stays servable.
    pub async fn ensure_fresh<F, Fut>(&self, fetch: F)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<ModelInfo>>>,
    {
        if !self.is_empty() && !self.is_stale() {
            return;
        }
        let before = self.read().generation;
        let _slot = self.refill.lock().await;
        if self.read().generation != before {
            // someone refilled while we waited
            return;
        }

        match fetch().await {
            Ok(records) if !records.is_empty() => {
                info!(count = records.len(), "model catalog refreshed");
                self.update(records);
            }
            Ok(_) => {
                warn!("upstream returned an empty model listing, serving fallback");
                self.install(fallback_models(self.default_max_input_tokens), true);
            }
            Err(e) => {
                warn!(error = %e, "model listing failed, serving fallback");
                self.install(fallback_models(self.default_max_input_tokens), true);
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CacheState> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CacheState> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Served when the upstream listing is unreachable.
fn fallback_models(default_max_input_tokens: u32) -> Vec<ModelInfo> {
    [
        ("claude-opus-4-5", 2.2),
        ("claude-sonnet-4-5", 1.0),
        ("claude-sonnet-4", 1.0),
        ("claude-haiku-4-5", 0.3),
        ("claude-3-7-sonnet-20250219", 1.0),
        ("auto", 1.0),
    ]
    .into_iter()
    .map(|(id, credits)| ModelInfo {
        id: id.to_string(),
        max_input_tokens: default_max_input_tokens,
        default_credits_used: credits,
    })
    .collect()
}

// ── Upstream listing ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListAvailableModelsResponse {
    #[serde(default)]
    models: Vec<ListedModel>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListedModel {
    model_id: String,
    #[serde(default)]
    token_limits: Option<TokenLimits>,
    #[serde(default)]
    credits_used: Option<f64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenLimits {
    #[serde(default)]
    max_input_tokens: Option<u32>,
}

/// Decode a `ListAvailableModels` body into cache records.
pub fn parse_model_listing(body: &str, default_max_input_tokens: u32) -> Result<Vec<ModelInfo>> {
    let resp: ListAvailableModelsResponse = serde_json::from_str(body)?;
    Ok(resp
        .models
        .into_iter()
        .map(|m| ModelInfo {
            id: m.model_id,
            max_input_tokens: m
                .token_limits
                .and_then(|t| t.max_input_tokens)
                .unwrap_or(default_max_input_tokens),
            default_credits_used: m.credits_used.unwrap_or(1.0),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, max: u32) -> ModelInfo {
        ModelInfo {
            id: id.to_string(),
            max_input_tokens: max,
            default_credits_used: 1.0,
        }
    }

    #[test]
    fn empty_cache_is_stale_and_serves_default_limit() {
        let cache = ModelCache::new(3600, 200_000);
        assert!(cache.is_empty());
        assert!(cache.is_stale());
        assert_eq!(cache.get_max_input_tokens("anything"), 200_000);
    }

    #[test]
    fn update_replaces_atomically_and_keeps_order() {
        let cache = ModelCache::new(3600, 200_000);
        cache.update(vec![info("b", 100), info("a", 50)]);
        assert!(!cache.is_stale());
        assert_eq!(cache.all_ids(), vec!["b", "a"]);
        assert_eq!(cache.get_max_input_tokens("b"), 100);

        cache.update(vec![info("c", 10)]);
        assert!(cache.get("a").is_none());
        assert_eq!(cache.all_ids(), vec!["c"]);
    }

    #[test]
    fn zero_ttl_cache_goes_stale_immediately() {
        let cache = ModelCache::new(0, 200_000);
        cache.update(vec![info("a", 1)]);
        assert!(cache.is_stale());
    }

    #[tokio::test]
    async fn ensure_fresh_skips_when_cache_is_warm() {
        let cache = ModelCache::new(3600, 200_000);
        cache.ensure_fresh(|| async { Ok(vec![info("a", 1)]) }).await;
        // warm cache: the second fetch must not run
        cache
            .ensure_fresh(|| async { panic!("refill should have been skipped") })
            .await;
        assert_eq!(cache.all_ids(), vec!["a"]);
    }

    #[tokio::test]
    async fn failed_refill_installs_fallback_marked_stale() {
        let cache = ModelCache::new(3600, 200_000);
        cache
            .ensure_fresh(|| async {
                Err(kiro_core::error::GatewayError::Network("down".into()))
            })
            .await;
        assert!(!cache.is_empty());
        assert!(cache.is_stale());
        assert!(cache.all_ids().contains(&"claude-sonnet-4-5".to_string()));
        assert_eq!(cache.get_max_input_tokens("claude-sonnet-4-5"), 200_000);
    }

    #[test]
    fn listing_parse_with_and_without_limits() {
        let body = r#"{"models":[
            {"modelId":"CLAUDE_SONNET_4_5_20250929_V1_0","tokenLimits":{"maxInputTokens":180000},"creditsUsed":1.0},
            {"modelId":"claude-haiku-4.5"}
        ]}"#;
        let models = parse_model_listing(body, 200_000).unwrap();
        assert_eq!(models[0].max_input_tokens, 180_000);
        assert_eq!(models[1].max_input_tokens, 200_000);
        assert_eq!(models[1].default_credits_used, 1.0);
    }
}
