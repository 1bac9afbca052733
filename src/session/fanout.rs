//! Write fan-out coordinator.
//!
//! A write runs on every configured writer under a per-writer transaction:
//! connect, BEGIN, execute, COMMIT, with rollback everywhere if any
//! execute fails. The commit phase is not a true two-phase commit; when a
//! later writer fails to commit after an earlier one already has, the
//! divergence is reported to the client instead of being hidden.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::{Duration, Instant};
use tracing::{error, warn};

use crate::backend::{BackendConnection, with_deadline};
use crate::error::{ProxyError, ProxyResult};
use crate::messages::Oid;
use crate::server::ProxyShared;

/// Grace window for rollbacks after the query deadline has already fired.
const ROLLBACK_GRACE: Duration = Duration::from_secs(2);

/// One write statement with its bound parameters. An empty parameter list
/// runs over the simple protocol, anything else over the extended one.
pub(crate) struct WriteStatement<'a> {
    pub sql: &'a str,
    pub param_types: &'a [Oid],
    pub parameters: &'a [Option<Bytes>],
    pub parameter_format_codes: &'a [i16],
}

/// The operations the coordinator needs from a writer session. The seam
/// exists so the all-or-nothing property can be exercised without sockets.
#[async_trait]
pub(crate) trait WriteBackend: Send {
    fn endpoint(&self) -> &str;

    async fn begin(&mut self) -> ProxyResult<()>;

    /// Run the statement, returning its command tag.
    async fn execute(&mut self, statement: &WriteStatement<'_>) -> ProxyResult<String>;

    async fn commit(&mut self) -> ProxyResult<()>;

    async fn rollback(&mut self) -> ProxyResult<()>;

    async fn close(&mut self);
}

#[async_trait]
impl WriteBackend for BackendConnection {
    fn endpoint(&self) -> &str {
        BackendConnection::endpoint(self)
    }

    async fn begin(&mut self) -> ProxyResult<()> {
        self.simple_query("BEGIN").await.map(|_| ())
    }

    async fn execute(&mut self, statement: &WriteStatement<'_>) -> ProxyResult<String> {
        if statement.parameters.is_empty() {
            self.simple_query(statement.sql).await
        } else {
            self.extended_query(
                statement.sql,
                statement.param_types,
                statement.parameters,
                statement.parameter_format_codes,
            )
            .await
        }
    }

    async fn commit(&mut self) -> ProxyResult<()> {
        self.simple_query("COMMIT").await.map(|_| ())
    }

    async fn rollback(&mut self) -> ProxyResult<()> {
        self.simple_query("ROLLBACK").await.map(|_| ())
    }

    async fn close(&mut self) {
        BackendConnection::close(self).await;
    }
}

/// Connect to every configured writer and run the statement through the
/// coordinated fan-out. Unreachable writers are skipped with a warning;
/// their divergence is operator-visible, not an error for the client.
pub(crate) async fn execute_write(
    shared: &ProxyShared,
    statement: &WriteStatement<'_>,
) -> ProxyResult<String> {
    let deadline = Instant::now() + shared.query_deadline;

    let mut backends = Vec::with_capacity(shared.writers.len());
    for endpoint in &shared.writers {
        match with_deadline(
            deadline,
            BackendConnection::connect(endpoint, &shared.backend_tls),
        )
        .await
        {
            Ok(conn) => backends.push(conn),
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "skipping writer: connect failed");
            }
        }
    }

    fan_out(backends, statement, deadline).await
}

/// Coordinated all-or-nothing execution over an already-connected writer
/// set, in configured order.
pub(crate) async fn fan_out<B: WriteBackend>(
    backends: Vec<B>,
    statement: &WriteStatement<'_>,
    deadline: Instant,
) -> ProxyResult<String> {
    if backends.is_empty() {
        return Err(ProxyError::NoWritersAvailable);
    }

    // begin phase: a writer that cannot open a transaction drops out
    let mut active: Vec<B> = Vec::with_capacity(backends.len());
    for mut backend in backends {
        match with_deadline(deadline, backend.begin()).await {
            Ok(()) => active.push(backend),
            Err(e) => {
                warn!(endpoint = %backend.endpoint(), error = %e, "skipping writer: begin failed");
                backend.close().await;
            }
        }
    }
    if active.is_empty() {
        return Err(ProxyError::NoWritersAvailable);
    }

    // execute phase: the first failure rolls everyone back
    let mut tag: Option<String> = None;
    for index in 0..active.len() {
        match with_deadline(deadline, active[index].execute(statement)).await {
            Ok(writer_tag) => {
                // the first writer's tag is authoritative
                tag.get_or_insert(writer_tag);
            }
            Err(e) => {
                abort_all(&mut active).await;
                return Err(e);
            }
        }
    }

    // commit phase: a failure here can leave committed writers behind,
    // which is reported, never silently absorbed
    let mut committed: Vec<String> = Vec::new();
    for index in 0..active.len() {
        if let Err(e) = with_deadline(deadline, active[index].commit()).await {
            let failed = active[index].endpoint().to_owned();
            let mut remainder = active.split_off(index + 1);
            abort_all(&mut remainder).await;
            close_all(&mut active).await;

            return Err(if committed.is_empty() {
                e
            } else {
                error!(
                    committed = %committed.join(", "),
                    failed = %failed,
                    "commit diverged across writers, reconciliation required"
                );
                ProxyError::CommitDivergence {
                    committed: committed.join(", "),
                    failed: format!("{} ({})", failed, e),
                }
            });
        }
        committed.push(active[index].endpoint().to_owned());
    }

    close_all(&mut active).await;
    tag.ok_or(ProxyError::BackendProtocol("fan-out"))
}

/// Best-effort rollback and close. Runs under a fresh grace deadline so a
/// write that failed by timeout still gets its rollbacks.
async fn abort_all<B: WriteBackend>(backends: &mut Vec<B>) {
    let grace = Instant::now() + ROLLBACK_GRACE;
    for backend in backends.iter_mut() {
        if let Err(e) = with_deadline(grace, backend.rollback()).await {
            warn!(endpoint = %backend.endpoint(), error = %e, "rollback failed");
        }
        let _ = tokio::time::timeout_at(grace, backend.close()).await;
    }
}

async fn close_all<B: WriteBackend>(backends: &mut Vec<B>) {
    let grace = Instant::now() + ROLLBACK_GRACE;
    for backend in backends.iter_mut() {
        let _ = tokio::time::timeout_at(grace, backend.close()).await;
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use super::*;

    const STATEMENT: WriteStatement<'static> = WriteStatement {
        sql: "INSERT INTO t VALUES (1)",
        param_types: &[],
        parameters: &[],
        parameter_format_codes: &[],
    };

    #[derive(Clone, Copy, Default)]
    struct Faults {
        begin: bool,
        execute: bool,
        commit: bool,
        stall_execute: bool,
    }

    struct ScriptedBackend {
        name: &'static str,
        faults: Faults,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedBackend {
        fn new(
            name: &'static str,
            faults: Faults,
            log: &Arc<Mutex<Vec<String>>>,
        ) -> ScriptedBackend {
            ScriptedBackend {
                name,
                faults,
                log: log.clone(),
            }
        }

        fn record(&self, op: &str) {
            self.log.lock().unwrap().push(format!("{}:{}", self.name, op));
        }

        fn fail(&self, op: &str) -> ProxyError {
            ProxyError::Backend {
                code: "XX000".to_owned(),
                message: format!("{} scripted to fail {}", self.name, op),
            }
        }
    }

    #[async_trait]
    impl WriteBackend for ScriptedBackend {
        fn endpoint(&self) -> &str {
            self.name
        }

        async fn begin(&mut self) -> ProxyResult<()> {
            self.record("begin");
            if self.faults.begin {
                return Err(self.fail("begin"));
            }
            Ok(())
        }

        async fn execute(&mut self, _statement: &WriteStatement<'_>) -> ProxyResult<String> {
            if self.faults.stall_execute {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.record("execute");
            if self.faults.execute {
                return Err(self.fail("execute"));
            }
            Ok(format!("INSERT 0 1 via {}", self.name))
        }

        async fn commit(&mut self) -> ProxyResult<()> {
            self.record("commit");
            if self.faults.commit {
                return Err(self.fail("commit"));
            }
            Ok(())
        }

        async fn rollback(&mut self) -> ProxyResult<()> {
            self.record("rollback");
            Ok(())
        }

        async fn close(&mut self) {
            self.record("close");
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_all_writers_commit() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let backends = vec![
            ScriptedBackend::new("w1", Faults::default(), &log),
            ScriptedBackend::new("w2", Faults::default(), &log),
        ];

        let tag = fan_out(backends, &STATEMENT, deadline()).await.unwrap();
        // first writer's tag wins even when writers disagree
        assert_eq!(tag, "INSERT 0 1 via w1");

        let log = log.lock().unwrap();
        assert_eq!(
            *log,
            vec![
                "w1:begin",
                "w2:begin",
                "w1:execute",
                "w2:execute",
                "w1:commit",
                "w2:commit",
                "w1:close",
                "w2:close",
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_writer_set_is_an_error() {
        let result = fan_out(Vec::<ScriptedBackend>::new(), &STATEMENT, deadline()).await;
        assert!(matches!(result, Err(ProxyError::NoWritersAvailable)));
    }

    #[tokio::test]
    async fn test_execute_failure_rolls_back_everyone() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let backends = vec![
            ScriptedBackend::new("w1", Faults::default(), &log),
            ScriptedBackend::new(
                "w2",
                Faults {
                    execute: true,
                    ..Faults::default()
                },
                &log,
            ),
        ];

        let result = fan_out(backends, &STATEMENT, deadline()).await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("w2 scripted to fail execute"));

        let log = log.lock().unwrap();
        assert!(log.contains(&"w1:rollback".to_owned()));
        assert!(log.contains(&"w2:rollback".to_owned()));
        assert!(!log.iter().any(|entry| entry.ends_with(":commit")));
    }

    #[tokio::test]
    async fn test_begin_failure_drops_only_that_writer() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let backends = vec![
            ScriptedBackend::new(
                "w1",
                Faults {
                    begin: true,
                    ..Faults::default()
                },
                &log,
            ),
            ScriptedBackend::new("w2", Faults::default(), &log),
        ];

        let tag = fan_out(backends, &STATEMENT, deadline()).await.unwrap();
        assert_eq!(tag, "INSERT 0 1 via w2");

        let log = log.lock().unwrap();
        assert!(!log.contains(&"w1:execute".to_owned()));
        assert!(log.contains(&"w2:commit".to_owned()));
    }

    #[tokio::test]
    async fn test_first_commit_failure_is_not_divergence() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let backends = vec![
            ScriptedBackend::new(
                "w1",
                Faults {
                    commit: true,
                    ..Faults::default()
                },
                &log,
            ),
            ScriptedBackend::new("w2", Faults::default(), &log),
        ];

        let err = fan_out(backends, &STATEMENT, deadline()).await.unwrap_err();
        // nothing committed yet, so the plain commit error surfaces
        assert!(!matches!(err, ProxyError::CommitDivergence { .. }));

        let log = log.lock().unwrap();
        assert!(log.contains(&"w2:rollback".to_owned()));
        assert!(!log.contains(&"w2:commit".to_owned()));
    }

    #[tokio::test]
    async fn test_late_commit_failure_reports_divergence() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let backends = vec![
            ScriptedBackend::new("w1", Faults::default(), &log),
            ScriptedBackend::new(
                "w2",
                Faults {
                    commit: true,
                    ..Faults::default()
                },
                &log,
            ),
            ScriptedBackend::new("w3", Faults::default(), &log),
        ];

        let err = fan_out(backends, &STATEMENT, deadline()).await.unwrap_err();
        match err {
            ProxyError::CommitDivergence { ref committed, ref failed } => {
                assert_eq!(committed, "w1");
                assert!(failed.starts_with("w2"));
            }
            other => panic!("expected divergence, got {:?}", other),
        }
        assert_eq!(err.sqlstate(), "XX000");

        // w3 never committed and was rolled back
        let log = log.lock().unwrap();
        assert!(log.contains(&"w3:rollback".to_owned()));
        assert!(!log.contains(&"w3:commit".to_owned()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry_takes_the_rollback_path() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let backends = vec![
            ScriptedBackend::new("w1", Faults::default(), &log),
            ScriptedBackend::new(
                "w2",
                Faults {
                    stall_execute: true,
                    ..Faults::default()
                },
                &log,
            ),
        ];

        let deadline = Instant::now() + Duration::from_millis(100);
        let err = fan_out(backends, &STATEMENT, deadline).await.unwrap_err();
        assert!(matches!(err, ProxyError::DeadlineExceeded));
        assert_eq!(err.sqlstate(), "57014");

        let log = log.lock().unwrap();
        assert!(log.contains(&"w1:rollback".to_owned()));
        assert!(log.contains(&"w2:rollback".to_owned()));
    }
}
