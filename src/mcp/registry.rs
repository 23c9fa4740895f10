//! Server registry — the single fan-out surface over all tool sessions.
//!
//! Owns the session table and presents high-level operations only
//! (connect, health checks, discovery, dispatch, cleanup); raw sessions are
//! never handed out, so the locking discipline cannot be bypassed.
//! Structural mutation takes the write lock; fan-out reads snapshot the
//! slot list first and tolerate concurrent removal.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use super::errors::McpError;
use super::session::{StdioSession, ToolChannel};
use super::types::{ServerConfig, ServersConfig, ToolContent, ToolDescriptor};

// ─── Configuration ───────────────────────────────────────────────────────────

/// Tunables for connection retry, probing, and per-call deadlines.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Connection attempts per `connect` call.
    pub max_retries: u32,
    /// Base delay for exponential connect backoff.
    pub retry_base_delay: Duration,
    /// Upper bound on a single backoff delay.
    pub retry_delay_cap: Duration,
    /// Deadline for the spawn + initialize handshake.
    pub init_timeout: Duration,
    /// Deadline for the liveness probe round trip.
    pub probe_timeout: Duration,
    /// Deadline for one tool-listing round trip.
    pub list_timeout: Duration,
    /// Deadline for one tool call.
    pub call_timeout: Duration,
    /// Overall budget for the reconnection round inside `dispatch`.
    pub reconnect_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_delay_cap: Duration::from_secs(10),
            init_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            list_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(60),
            reconnect_timeout: Duration::from_secs(30),
        }
    }
}

/// Backoff delay before retry number `attempt` (1-based).
pub(crate) fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(cap)
}

// ─── Session Slots ───────────────────────────────────────────────────────────

/// One registered session plus its liveness bookkeeping.
struct SessionSlot {
    channel: Arc<dyn ToolChannel>,
    last_check: StdMutex<Instant>,
}

impl SessionSlot {
    fn new(channel: Arc<dyn ToolChannel>) -> Arc<Self> {
        Arc::new(Self {
            channel,
            last_check: StdMutex::new(Instant::now()),
        })
    }

    fn touch(&self) {
        if let Ok(mut guard) = self.last_check.lock() {
            *guard = Instant::now();
        }
    }

    fn checked_within(&self, interval: Duration) -> bool {
        self.last_check
            .lock()
            .map(|guard| guard.elapsed() < interval)
            .unwrap_or(false)
    }
}

// ─── ServerRegistry ──────────────────────────────────────────────────────────

/// Registry of subprocess-backed tool sessions.
pub struct ServerRegistry {
    configs: HashMap<String, ServerConfig>,
    /// Slots in registration order — dispatch scans in this order.
    slots: RwLock<Vec<Arc<SessionSlot>>>,
    options: RegistryConfig,
}

impl ServerRegistry {
    pub fn new(config: ServersConfig, options: RegistryConfig) -> Self {
        Self {
            configs: config.servers,
            slots: RwLock::new(Vec::new()),
            options,
        }
    }

    /// Names of all configured servers, sorted.
    pub fn configured_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of currently connected servers, in registration order.
    pub async fn connected_servers(&self) -> Vec<String> {
        self.snapshot()
            .await
            .iter()
            .map(|slot| slot.channel.name().to_string())
            .collect()
    }

    pub async fn is_connected(&self, name: &str) -> bool {
        self.snapshot()
            .await
            .iter()
            .any(|slot| slot.channel.name() == name)
    }

    async fn snapshot(&self) -> Vec<Arc<SessionSlot>> {
        self.slots.read().await.clone()
    }

    async fn find_slot(&self, name: &str) -> Option<Arc<SessionSlot>> {
        self.snapshot()
            .await
            .into_iter()
            .find(|slot| slot.channel.name() == name)
    }

    /// Insert a channel, replacing any previous slot with the same name.
    pub(crate) async fn register(&self, channel: Arc<dyn ToolChannel>) {
        let slot = SessionSlot::new(channel);
        let mut slots = self.slots.write().await;
        slots.retain(|existing| existing.channel.name() != slot.channel.name());
        slots.push(slot);
    }

    // ─── Connect ─────────────────────────────────────────────────────────

    /// Connect to a configured server with exponential-backoff retry.
    ///
    /// Fails with `Config` only when the name is unknown; ordinary
    /// connection failures are retried and ultimately reported as `false`.
    pub async fn connect(&self, name: &str, timeout: Duration) -> Result<bool, McpError> {
        let config = self
            .configs
            .get(name)
            .ok_or_else(|| McpError::Config {
                reason: format!("server '{name}' not found in configuration"),
            })?
            .clone();

        let server = name.to_string();
        let init_timeout = self.options.init_timeout;
        let channel = connect_with_retry(&self.options, timeout, || {
            let config = config.clone();
            let server = server.clone();
            async move {
                let session = StdioSession::connect(&server, &config, init_timeout).await?;
                Ok(Arc::new(session) as Arc<dyn ToolChannel>)
            }
        })
        .await;

        match channel {
            Some(channel) => {
                // Replace any stale session for the same server.
                self.cleanup(name).await;
                self.register(channel).await;
                tracing::info!(server = %name, "server connected");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ─── Health ──────────────────────────────────────────────────────────

    /// Probe one server. An unhealthy session is cleaned up as a side
    /// effect — a failed check never leaves a half-dead session registered.
    pub async fn check_health(&self, name: &str) -> bool {
        let Some(slot) = self.find_slot(name).await else {
            return false;
        };

        if slot.channel.probe(self.options.probe_timeout).await {
            slot.touch();
            true
        } else {
            tracing::warn!(server = %name, "health check failed, cleaning up");
            self.cleanup(name).await;
            false
        }
    }

    /// Probe all servers in sorted-name order, skipping those checked
    /// within `interval`. Fails with the first unhealthy server so the
    /// report is reproducible; later servers are not probed on failure.
    pub async fn check_all_health(&self, interval: Duration) -> Result<(), McpError> {
        let mut slots = self.snapshot().await;
        slots.sort_by(|a, b| a.channel.name().cmp(b.channel.name()));

        for slot in slots {
            let name = slot.channel.name().to_string();
            if slot.checked_within(interval) {
                continue;
            }
            if slot.channel.probe(self.options.probe_timeout).await {
                slot.touch();
            } else {
                self.cleanup(&name).await;
                return Err(McpError::Connection {
                    server: name,
                    reason: "health check failed".into(),
                });
            }
        }
        Ok(())
    }

    /// One background-sweep pass: probe every stale session, cleaning up
    /// failures without stopping at the first one.
    async fn sweep_once(&self, interval: Duration) {
        let mut slots = self.snapshot().await;
        slots.sort_by(|a, b| a.channel.name().cmp(b.channel.name()));

        for slot in slots {
            let name = slot.channel.name().to_string();
            if slot.checked_within(interval) {
                continue;
            }
            if slot.channel.probe(self.options.probe_timeout).await {
                slot.touch();
            } else {
                tracing::warn!(server = %name, "liveness sweep removing unhealthy server");
                self.cleanup(&name).await;
            }
        }
    }

    /// Spawn the periodic liveness sweep. The returned handle is aborted on
    /// shutdown; the sweep never blocks in-flight queries.
    pub fn spawn_liveness_sweep(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; sessions were just connected.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                registry.sweep_once(interval).await;
            }
        })
    }

    // ─── Discovery & Dispatch ────────────────────────────────────────────

    /// Fan-out tool discovery. A failing server is logged and omitted;
    /// discovery never fails globally because one backend is down.
    pub async fn list_all_tools(&self) -> Vec<ToolDescriptor> {
        let slots = self.snapshot().await;
        let mut all = Vec::new();

        for slot in slots {
            match slot.channel.list_tools(self.options.list_timeout).await {
                Ok(tools) => {
                    tracing::debug!(
                        server = %slot.channel.name(),
                        tool_count = tools.len(),
                        "discovered tools"
                    );
                    all.extend(tools);
                }
                Err(e) => {
                    tracing::warn!(
                        server = %slot.channel.name(),
                        error = %e,
                        "tool discovery failed, omitting server"
                    );
                }
            }
        }
        all
    }

    /// Find the first session exposing `tool_name` and call it.
    ///
    /// Sessions are scanned in registration order and the first match wins;
    /// tool names are not required to be globally unique, so a duplicate
    /// name on a later server is shadowed. Returns `None` when no session
    /// exposes the tool or every candidate failed.
    pub async fn dispatch(
        &self,
        tool_name: &str,
        args: &serde_json::Value,
    ) -> Option<ToolContent> {
        let mut reconnect_budget: u32 = 1;

        loop {
            let slots = self.snapshot().await;
            if slots.is_empty() {
                return None;
            }

            let mut failed: HashSet<String> = HashSet::new();

            for slot in &slots {
                let server = slot.channel.name().to_string();
                if failed.contains(&server) {
                    continue;
                }

                let tools = match slot.channel.list_tools(self.options.list_timeout).await {
                    Ok(tools) => tools,
                    Err(e) => {
                        tracing::warn!(server = %server, error = %e, "listing failed during dispatch");
                        failed.insert(server);
                        continue;
                    }
                };

                if !tools.iter().any(|tool| tool.name == tool_name) {
                    continue;
                }

                tracing::info!(tool = %tool_name, server = %server, "dispatching tool call");
                match slot
                    .channel
                    .call_tool(tool_name, args, self.options.call_timeout)
                    .await
                {
                    Ok(content) => return Some(content),
                    Err(e) => {
                        tracing::warn!(
                            tool = %tool_name,
                            server = %server,
                            error = %e,
                            "tool call failed, trying next server"
                        );
                        if e.is_transport_level() {
                            self.cleanup(&server).await;
                        }
                        failed.insert(server);
                    }
                }
            }

            // One bounded reconnection round when every session failed.
            if failed.len() == slots.len() && reconnect_budget > 0 {
                reconnect_budget -= 1;
                tracing::info!("all servers failed during dispatch, attempting reconnection");
                for server in failed {
                    if let Err(e) = self.connect(&server, self.options.reconnect_timeout).await {
                        tracing::warn!(server = %server, error = %e, "reconnection skipped");
                    }
                }
                continue;
            }

            return None;
        }
    }

    // ─── Cleanup ─────────────────────────────────────────────────────────

    /// Tear down one server's session. Idempotent; in-memory state is
    /// discarded even if subprocess termination misbehaves.
    pub async fn cleanup(&self, name: &str) {
        let removed: Vec<Arc<SessionSlot>> = {
            let mut slots = self.slots.write().await;
            let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut *slots)
                .into_iter()
                .partition(|slot| slot.channel.name() == name);
            *slots = kept;
            gone
        };

        for slot in removed {
            slot.channel.shutdown().await;
            tracing::info!(server = %name, "session cleaned up");
        }
    }

    /// Tear down every session. Idempotent; used from shutdown paths, so a
    /// failure on one session never stops the sweep.
    pub async fn cleanup_all(&self) {
        let all: Vec<Arc<SessionSlot>> = {
            let mut slots = self.slots.write().await;
            std::mem::take(&mut *slots)
        };

        futures::future::join_all(all.iter().map(|slot| slot.channel.shutdown())).await;
        for slot in &all {
            tracing::info!(server = %slot.channel.name(), "session cleaned up");
        }
    }
}

// ─── Connect Retry ───────────────────────────────────────────────────────────

/// Run `attempt_fn` up to `max_retries` times under an overall wall-clock
/// budget, sleeping the exponential backoff between attempts.
async fn connect_with_retry<F, Fut>(
    options: &RegistryConfig,
    overall_timeout: Duration,
    mut attempt_fn: F,
) -> Option<Arc<dyn ToolChannel>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Arc<dyn ToolChannel>, McpError>>,
{
    let started = Instant::now();

    for attempt in 1..=options.max_retries {
        if started.elapsed() >= overall_timeout {
            tracing::warn!(attempt, "connection budget exhausted");
            break;
        }

        if attempt > 1 {
            let delay = backoff_delay(
                attempt - 1,
                options.retry_base_delay,
                options.retry_delay_cap,
            );
            tracing::info!(delay_secs = delay.as_secs(), "retrying connection");
            tokio::time::sleep(delay).await;
        }

        match attempt_fn().await {
            Ok(channel) => return Some(channel),
            Err(e) => {
                tracing::warn!(attempt, error = %e, "connection attempt failed");
            }
        }
    }

    None
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::mcp::session::test_support::FakeChannel;

    fn empty_registry() -> ServerRegistry {
        ServerRegistry::new(ServersConfig::default(), RegistryConfig::default())
    }

    #[tokio::test]
    async fn test_dispatch_first_match_wins() {
        let registry = empty_registry();
        let first = Arc::new(FakeChannel::new("alpha", &["echo"]).with_reply("from alpha"));
        let second = Arc::new(FakeChannel::new("beta", &["echo"]).with_reply("from beta"));
        registry.register(first.clone()).await;
        registry.register(second.clone()).await;

        let result = registry
            .dispatch("echo", &serde_json::json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(result.joined_text(), "from alpha");
        assert_eq!(second.call_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_tool_returns_none() {
        let registry = empty_registry();
        registry
            .register(Arc::new(FakeChannel::new("alpha", &["echo"])))
            .await;

        let result = registry.dispatch("missing", &serde_json::json!({})).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_skips_failed_session() {
        let registry = empty_registry();
        let broken = Arc::new(FakeChannel::new("alpha", &["echo"]).failing_calls());
        let working = Arc::new(FakeChannel::new("beta", &["echo"]).with_reply("from beta"));
        registry.register(broken).await;
        registry.register(working).await;

        let result = registry
            .dispatch("echo", &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(result.joined_text(), "from beta");
    }

    #[tokio::test]
    async fn test_dispatch_all_failed_gives_none() {
        let registry = empty_registry();
        let broken = Arc::new(FakeChannel::new("alpha", &["echo"]).failing_calls());
        registry.register(broken.clone()).await;

        let result = registry.dispatch("echo", &serde_json::json!({})).await;
        assert!(result.is_none());
        assert_eq!(broken.call_count.load(Ordering::SeqCst), 1);
        // Transport-level failure removed the session.
        assert!(!registry.is_connected("alpha").await);
    }

    #[tokio::test]
    async fn test_health_failure_removes_session() {
        let registry = empty_registry();
        registry
            .register(Arc::new(FakeChannel::new("alpha", &["echo"]).unhealthy()))
            .await;

        assert!(!registry.check_health("alpha").await);
        assert!(!registry.is_connected("alpha").await);
        // Second check on the now-absent server is simply false.
        assert!(!registry.check_health("alpha").await);
    }

    #[tokio::test]
    async fn test_check_all_health_sorted_order_stops_at_first_failure() {
        let registry = empty_registry();
        // Registered out of name order on purpose.
        let gamma = Arc::new(FakeChannel::new("gamma", &[]));
        let alpha = Arc::new(FakeChannel::new("alpha", &[]));
        let beta = Arc::new(FakeChannel::new("beta", &[]).unhealthy());
        registry.register(gamma.clone()).await;
        registry.register(alpha.clone()).await;
        registry.register(beta.clone()).await;

        let err = registry
            .check_all_health(Duration::ZERO)
            .await
            .unwrap_err();
        match err {
            McpError::Connection { server, .. } => assert_eq!(server, "beta"),
            other => panic!("expected Connection error, got {other:?}"),
        }

        // alpha checked before the failure on beta; gamma never reached.
        assert_eq!(alpha.probe_count.load(Ordering::SeqCst), 1);
        assert_eq!(beta.probe_count.load(Ordering::SeqCst), 1);
        assert_eq!(gamma.probe_count.load(Ordering::SeqCst), 0);
        assert!(!registry.is_connected("beta").await);
    }

    #[tokio::test]
    async fn test_check_all_health_respects_interval() {
        let registry = empty_registry();
        let alpha = Arc::new(FakeChannel::new("alpha", &[]));
        registry.register(alpha.clone()).await;

        // Freshly registered slots were just checked.
        registry
            .check_all_health(Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(alpha.probe_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let registry = empty_registry();
        registry
            .register(Arc::new(FakeChannel::new("alpha", &["echo"])))
            .await;

        registry.cleanup("alpha").await;
        registry.cleanup("alpha").await;
        registry.cleanup_all().await;
        assert!(registry.connected_servers().await.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_once_cleans_all_unhealthy() {
        let registry = empty_registry();
        registry
            .register(Arc::new(FakeChannel::new("alpha", &[]).unhealthy()))
            .await;
        registry
            .register(Arc::new(FakeChannel::new("beta", &[]).unhealthy()))
            .await;

        registry.sweep_once(Duration::ZERO).await;
        assert!(registry.connected_servers().await.is_empty());
    }

    #[tokio::test]
    async fn test_connect_unknown_server_is_config_error() {
        let registry = empty_registry();
        let err = registry
            .connect("ghost", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Config { .. }));
    }

    #[test]
    fn test_backoff_schedule() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(10);
        assert_eq!(backoff_delay(1, base, cap), Duration::from_secs(1));
        assert_eq!(backoff_delay(2, base, cap), Duration::from_secs(2));
        assert_eq!(backoff_delay(3, base, cap), Duration::from_secs(4));
        assert_eq!(backoff_delay(4, base, cap), Duration::from_secs(8));
        assert_eq!(backoff_delay(5, base, cap), Duration::from_secs(10));
        assert_eq!(backoff_delay(6, base, cap), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retry_succeeds_on_third_attempt() {
        let options = RegistryConfig::default();
        let attempts = AtomicU32::new(0);
        let mut attempt_times: Vec<Instant> = Vec::new();

        let channel = connect_with_retry(&options, Duration::from_secs(120), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            attempt_times.push(Instant::now());
            async move {
                if n < 3 {
                    Err(McpError::SpawnFailed {
                        name: "flaky".into(),
                        reason: "transient".into(),
                    })
                } else {
                    Ok(Arc::new(FakeChannel::new("flaky", &["echo"])) as Arc<dyn ToolChannel>)
                }
            }
        })
        .await;

        assert!(channel.is_some());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // Delays double between attempts: 1s then 2s.
        assert_eq!(attempt_times[1] - attempt_times[0], Duration::from_secs(1));
        assert_eq!(attempt_times[2] - attempt_times[1], Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retry_exhausts_attempts() {
        let options = RegistryConfig::default();
        let attempts = AtomicU32::new(0);

        let channel = connect_with_retry(&options, Duration::from_secs(120), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<Arc<dyn ToolChannel>, _>(McpError::SpawnFailed {
                    name: "dead".into(),
                    reason: "always fails".into(),
                })
            }
        })
        .await;

        assert!(channel.is_none());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
