//! Root composition.
//!
//! [`Agent`] builds every pipeline component explicitly and wires them:
//!
//! ```text
//! server ─► pool ─► router ─┬─ cache hit ─────────────────────► pool ─► server
//!                           └─ scheduler ─► executor ─► cache ─► pool ─► server
//! ```
//!
//! Nothing is global; two agents in one process share no state.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::CommandResultCache;
use crate::config::AgentConfig;
use crate::error::Result;
use crate::health::HealthCoordinator;
use crate::identifiers::RequestId;
use crate::protocol::{AgentStatus, ExecutionResult, Message};
use crate::scheduler::executor::NOT_RUN_EXIT_CODE;
use crate::scheduler::{CommandExecutor, CommandHandle, CommandOptions, CommandScheduler};
use crate::transport::{ConnectionPool, Endpoint, InboundCommand};

// ============================================================================
// Agent
// ============================================================================

/// A running agent.
///
/// # Example
///
/// ```ignore
/// let executor = Arc::new(ProcessExecutor::new(["uptime", "df"]));
/// let agent = Agent::start(AgentConfig::from_env(), executor).await?;
///
/// tokio::signal::ctrl_c().await?;
/// agent.shutdown().await;
/// ```
pub struct Agent {
    config: AgentConfig,
    pipeline: Pipeline,
    health: Arc<HealthCoordinator>,
    router: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl Agent {
    /// Validates the configuration, builds the pipeline and connects.
    ///
    /// An unreachable server is not fatal: the pool keeps trying in the
    /// background.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`](crate::Error::Config) for an invalid configuration
    /// - [`Error::Authentication`](crate::Error::Authentication) if the server
    ///   rejects the credentials
    pub async fn start(config: AgentConfig, executor: Arc<dyn CommandExecutor>) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(CommandResultCache::new(config.cache.clone()));
        cache.spawn_sweeper();

        let (pool, inbound) = ConnectionPool::new(
            Endpoint::from_config(&config),
            config.session.clone(),
            config.pool.clone(),
        );
        let scheduler = CommandScheduler::new(config.scheduler.clone(), executor);
        let health = HealthCoordinator::new(
            config.health.clone(),
            Arc::clone(&pool),
            Arc::clone(&scheduler),
            Arc::clone(&cache),
        );

        let pipeline = Pipeline {
            pool,
            scheduler,
            cache,
        };
        let router = tokio::spawn(route(inbound, pipeline.clone()));

        let agent = Self {
            config,
            pipeline,
            health,
            router: Mutex::new(Some(router)),
            shutdown: AtomicBool::new(false),
        };

        match agent.pipeline.pool.get_connection().await {
            Ok(session) => info!(session_id = %session.id(), "Connected to control server"),
            Err(e) if e.is_authentication_error() => {
                error!(error = %e, "Authentication rejected");
                agent.teardown().await;
                return Err(e);
            }
            Err(e) => warn!(error = %e, "Control server unreachable, retrying in background"),
        }

        if !agent
            .pipeline
            .pool
            .send_message(&Message::status(AgentStatus::Ready))
            .await
        {
            debug!("Ready status not delivered");
        }

        info!(agent_id = %agent.config.agent_id, url = %agent.config.server_url, "Agent started");
        Ok(agent)
    }

    /// Returns the configuration the agent runs with.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Returns the connection pool.
    #[inline]
    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pipeline.pool
    }

    /// Returns the command scheduler.
    #[inline]
    #[must_use]
    pub fn scheduler(&self) -> &Arc<CommandScheduler> {
        &self.pipeline.scheduler
    }

    /// Returns the result cache.
    #[inline]
    #[must_use]
    pub fn cache(&self) -> &Arc<CommandResultCache> {
        &self.pipeline.cache
    }

    /// Returns the health coordinator.
    #[inline]
    #[must_use]
    pub fn health(&self) -> &Arc<HealthCoordinator> {
        &self.health
    }

    /// Returns `true` after [`shutdown`](Self::shutdown).
    #[inline]
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Returns the number of live timers across all components.
    #[must_use]
    pub fn timer_count(&self) -> usize {
        let router = self
            .router
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished());

        usize::from(router)
            + self.health.timer_count()
            + self.pipeline.scheduler.timer_count()
            + self.pipeline.cache.timer_count()
            + self.pipeline.pool.timer_count()
    }

    /// Announces `disconnected` and stops every component. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.pipeline.pool.active_session_id().is_some() {
            let _ = self
                .pipeline
                .pool
                .send_message(&Message::status(AgentStatus::Disconnected))
                .await;
        }

        self.teardown().await;
        info!(agent_id = %self.config.agent_id, "Agent stopped");
    }

    /// Health, scheduler, cache, pool, in that order.
    async fn teardown(&self) {
        if let Some(router) = self.router.lock().take() {
            router.abort();
        }
        self.health.cleanup();
        self.pipeline.scheduler.cleanup();
        self.pipeline.cache.cleanup();
        self.pipeline.pool.cleanup().await;
    }
}

// ============================================================================
// Routing
// ============================================================================

/// Components on the request path.
#[derive(Clone)]
struct Pipeline {
    pool: Arc<ConnectionPool>,
    scheduler: Arc<CommandScheduler>,
    cache: Arc<CommandResultCache>,
}

impl Pipeline {
    /// Answers from cache or schedules the command.
    async fn handle(&self, inbound: InboundCommand) {
        let InboundCommand {
            session_id,
            request_id,
            command,
        } = inbound;

        if let Some(result) = self.cache.get(&command) {
            debug!(%request_id, "Answered from cache");
            self.reply(request_id, result).await;
            return;
        }

        let options = CommandOptions::new().with_metadata(json!({
            "requestId": request_id.as_str(),
            "sessionId": session_id.to_string(),
        }));

        match self.scheduler.enqueue(command.clone(), options) {
            Ok(handle) => {
                debug!(%request_id, command_id = %handle.id(), "Command scheduled");
                let pipeline = self.clone();
                tokio::spawn(async move { pipeline.complete(request_id, command, handle).await });
            }
            Err(e) => {
                warn!(%request_id, error = %e, "Command refused");
                let result = ExecutionResult::failure(e.to_string(), NOT_RUN_EXIT_CODE);
                self.reply(request_id, result).await;
            }
        }
    }

    /// Waits for settlement, caches success and replies.
    async fn complete(self, request_id: RequestId, command: String, handle: CommandHandle) {
        let result = match handle.wait().await {
            Ok(result) => {
                self.cache.store(&command, &result);
                result
            }
            Err(e) => ExecutionResult::failure(e.to_string(), NOT_RUN_EXIT_CODE),
        };
        self.reply(request_id, result).await;
    }

    async fn reply(&self, request_id: RequestId, result: ExecutionResult) {
        let success = result.is_success();
        if self
            .pool
            .send_message(&Message::command_result(request_id.clone(), result))
            .await
        {
            debug!(%request_id, success, "Result sent");
        } else {
            warn!(%request_id, "Result not delivered");
        }
    }
}

/// Forwards every inbound command into the pipeline, in arrival order.
async fn route(mut inbound: mpsc::UnboundedReceiver<InboundCommand>, pipeline: Pipeline) {
    while let Some(command) = inbound.recv().await {
        pipeline.handle(command).await;
    }
    debug!("Inbound channel closed");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use async_trait::async_trait;

    use crate::config::{HealthConfig, PoolConfig, SchedulerConfig};
    use crate::error::Error;
    use crate::identifiers::CommandId;
    use crate::transport::mock::{MockBehavior, MockServer};

    #[derive(Default)]
    struct CountingExecutor {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandExecutor for CountingExecutor {
        async fn execute(&self, _id: CommandId, command: &str) -> Result<ExecutionResult> {
            self.calls.lock().push(command.to_string());
            if command == "false" {
                Ok(ExecutionResult::failure("exit status 1", 1))
            } else {
                Ok(ExecutionResult::success(format!("ran {command}")))
            }
        }
    }

    fn config(url: String) -> AgentConfig {
        AgentConfig::new(url, "agent-test", "secret")
            .with_scheduler(SchedulerConfig {
                batch_interval: Duration::from_millis(10),
                retry_delay: Duration::from_millis(10),
                default_max_attempts: 2,
                ..SchedulerConfig::default()
            })
            .with_health(HealthConfig {
                check_interval: Duration::from_secs(3600),
                optimize_interval: Duration::from_secs(3600),
            })
            .with_pool(PoolConfig {
                connect_retries: 1,
                base_backoff: Duration::from_millis(10),
                health_check_interval: Duration::from_secs(3600),
                ..PoolConfig::default()
            })
    }

    fn is_status(status: AgentStatus) -> impl Fn(&Message) -> bool {
        move |message| matches!(message, Message::Status { status: s } if *s == status)
    }

    fn result_for(request_id: &str) -> impl Fn(&Message) -> bool + '_ {
        move |message| {
            matches!(message, Message::CommandResult { request_id: id, .. } if id.as_str() == request_id)
        }
    }

    fn command(text: &str, request_id: &str) -> Message {
        Message::Command {
            command: text.to_string(),
            request_id: RequestId::new(request_id),
        }
    }

    #[tokio::test]
    async fn test_start_announces_ready() {
        let server = MockServer::start(MockBehavior::default()).await;
        let agent = Agent::start(config(server.url()), Arc::new(CountingExecutor::default()))
            .await
            .expect("agent starts");

        assert!(server.expect(is_status(AgentStatus::Ready)).await.is_some());
        assert!(agent.pool().active_session_id().is_some());

        agent.shutdown().await;
    }

    #[tokio::test]
    async fn test_command_executes_then_hits_cache() {
        let server = MockServer::start(MockBehavior::default()).await;
        let executor = Arc::new(CountingExecutor::default());
        let agent = Agent::start(config(server.url()), executor.clone())
            .await
            .expect("agent starts");
        server.expect(is_status(AgentStatus::Ready)).await;

        server.push(command("uptime", "r-1"));
        let first = server.expect(result_for("r-1")).await.expect("first result");
        let Message::CommandResult { result, .. } = first else {
            unreachable!();
        };
        assert!(result.is_success());
        assert_eq!(result.output, "ran uptime");

        server.push(command("uptime", "r-2"));
        let second = server.expect(result_for("r-2")).await.expect("cached result");
        let Message::CommandResult { result, .. } = second else {
            unreachable!();
        };
        assert_eq!(result.output, "ran uptime");

        assert_eq!(executor.calls.lock().len(), 1);
        assert_eq!(agent.cache().stats().hits, 1);

        agent.shutdown().await;
    }

    #[tokio::test]
    async fn test_failures_are_reported_and_not_cached() {
        let server = MockServer::start(MockBehavior::default()).await;
        let executor = Arc::new(CountingExecutor::default());
        let agent = Agent::start(config(server.url()), executor.clone())
            .await
            .expect("agent starts");
        server.expect(is_status(AgentStatus::Ready)).await;

        server.push(command("false", "r-1"));
        let reply = server.expect(result_for("r-1")).await.expect("result");
        let Message::CommandResult { result, .. } = reply else {
            unreachable!();
        };
        assert!(!result.is_success());
        assert_eq!(executor.calls.lock().len(), 2);
        assert_eq!(agent.cache().stats().items, 0);

        agent.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_queue_replies_immediately() {
        let server = MockServer::start(MockBehavior::default()).await;
        let mut config = config(server.url());
        config.scheduler.max_queue_size = 1;
        config.scheduler.batch_interval = Duration::from_secs(3600);

        let agent = Agent::start(config, Arc::new(CountingExecutor::default()))
            .await
            .expect("agent starts");
        server.expect(is_status(AgentStatus::Ready)).await;

        server.push(command("uptime", "r-1"));
        server.push(command("df", "r-2"));

        let reply = server.expect(result_for("r-2")).await.expect("refusal");
        let Message::CommandResult { result, .. } = reply else {
            unreachable!();
        };
        assert!(!result.is_success());
        assert_eq!(result.exit_code, NOT_RUN_EXIT_CODE);
        assert_eq!(agent.scheduler().stats().queue_depth, 1);

        agent.shutdown().await;
    }

    #[tokio::test]
    async fn test_auth_rejection_is_fatal() {
        let server = MockServer::start(MockBehavior {
            accept_auth: false,
            ..MockBehavior::default()
        })
        .await;

        let outcome = Agent::start(config(server.url()), Arc::new(CountingExecutor::default())).await;
        assert!(matches!(outcome, Err(Error::Authentication { .. })));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_not_fatal() {
        let url = format!("ws://127.0.0.1:{}", MockServer::unused_port().await);
        let agent = Agent::start(config(url), Arc::new(CountingExecutor::default()))
            .await
            .expect("agent starts offline");

        assert!(agent.pool().active_session_id().is_none());
        agent.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let outcome = Agent::start(
            AgentConfig::new("http://example.com", "agent-test", "secret"),
            Arc::new(CountingExecutor::default()),
        )
        .await;
        assert!(matches!(outcome, Err(Error::Config { .. })));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_stops_timers() {
        let server = MockServer::start(MockBehavior::default()).await;
        let agent = Agent::start(config(server.url()), Arc::new(CountingExecutor::default()))
            .await
            .expect("agent starts");
        server.expect(is_status(AgentStatus::Ready)).await;

        agent.shutdown().await;
        assert!(server.expect(is_status(AgentStatus::Disconnected)).await.is_some());

        agent.shutdown().await;
        assert!(agent.is_shutdown());
        assert_eq!(agent.timer_count(), 0);
    }
}
