//! Command handling and the load/cleanup/restart state machine.

use std::path::PathBuf;
use std::sync::Arc;

use robolink_ipc::CallbackPublisher;
use robolink_model::config::StorageConfig;
use robolink_model::{CallbackMessage, Command, ErrorCode, PushMessage, Reply};
use serde_json::{json, Map, Value};

use crate::executor::{PushFn, ScriptExecutor};
use crate::project::{ProjectKind, ProjectStore};

pub struct Service {
    store: ProjectStore,
    publisher: CallbackPublisher,
    executor: Option<ScriptExecutor>,
    project: Option<(PathBuf, ProjectKind)>,
    /// Set once a project has been loaded in this process; the next
    /// `update` then schedules a restart, because only process recycling
    /// truly clears the module cache.
    has_loaded_project: bool,
    restart_pending: bool,
}

impl Service {
    pub fn new(storage: &StorageConfig, publisher: CallbackPublisher) -> Self {
        Self {
            store: ProjectStore::new(storage),
            publisher,
            executor: None,
            project: None,
            has_loaded_project: false,
            restart_pending: false,
        }
    }

    pub fn restart_pending(&self) -> bool {
        self.restart_pending
    }

    /// Auto-load on spawn (and lazily on `process`): seed `current` from
    /// `default` if empty, then load whatever `current` holds. Failures
    /// are logged, not fatal; a later `update` can supply working code.
    pub fn try_load_existing_project(&mut self) {
        if let Err(error) = self.auto_load() {
            tracing::warn!(%error, "no project loaded at startup, waiting for an update");
        }
    }

    fn auto_load(&mut self) -> anyhow::Result<()> {
        self.store.seed_default_project()?;

        let current = self.store.current_dir();
        if !ProjectStore::dir_has_entries(&current)? {
            tracing::info!("no current project on disk");
            return Ok(());
        }

        let kind = self.store.detect_kind(&current)?;
        self.project = Some((current, kind));
        self.load_executor()?;
        self.has_loaded_project = true;
        tracing::info!("project loaded");

        Ok(())
    }

    pub fn handle(&mut self, command: Command) -> Reply {
        tracing::debug!(command = command.name(), "handling command");

        match command {
            Command::Update { archive } => self.handle_update(&archive),
            Command::Start => self.handle_start(),
            Command::Process {
                object,
                method,
                args,
            } => self.handle_process(&object, &method, &args),
            Command::ClientDisconnected { session_id } => {
                self.handle_client_disconnected(&session_id)
            }
        }
    }

    fn handle_update(&mut self, archive: &str) -> Reply {
        let will_restart = self.has_loaded_project;

        if let Some(mut executor) = self.executor.take() {
            executor.cleanup();
        }

        let (path, kind) = match self.store.extract_archive(archive) {
            Ok(extracted) => extracted,
            Err(error) => {
                tracing::error!(%error, "update rejected");
                return Reply::error_with_message(error.code(), error.to_string());
            }
        };
        self.project = Some((path, kind));

        let message = if will_restart {
            tracing::info!("worker will restart to clear the module cache");
            self.restart_pending = true;
            "project uploaded, the worker restarts to clear the module cache"
        } else {
            "project uploaded"
        };

        Reply::success_with_data(
            message,
            json!({ "project_kind": kind, "worker_will_restart": will_restart }),
        )
    }

    fn handle_start(&mut self) -> Reply {
        if self.project.is_none() {
            match self.store.recover_from_disk() {
                Ok(Some(recovered)) => {
                    tracing::info!("recovered project from disk");
                    self.project = Some(recovered);
                }
                Ok(None) => {
                    return Reply::error_with_message(
                        ErrorCode::ProjectNotFound,
                        "no project found, upload one first",
                    );
                }
                Err(error) => return Reply::error_with_message(error.code(), error.to_string()),
            }
        }

        match self.load_executor() {
            Ok(()) => {
                self.has_loaded_project = true;
                Reply::success("project started")
            }
            Err(error) => {
                self.executor = None;
                tracing::error!(%error, "start failed");
                Reply::error_with_message(ErrorCode::ProjectLoadFailed, error.to_string())
            }
        }
    }

    fn handle_process(&mut self, object: &str, method: &str, args: &Map<String, Value>) -> Reply {
        if self.executor.is_none() {
            self.try_load_existing_project();
        }
        let Some(executor) = self.executor.as_mut() else {
            return Reply::error(ErrorCode::ProjectNotFound);
        };

        executor.call(object, method, args)
    }

    fn handle_client_disconnected(&mut self, session_id: &str) -> Reply {
        tracing::info!(session_id, "client disconnected, stopping user background activity");

        // Stop hooks only; the loaded module and the instance context are
        // preserved so a reconnecting client resumes instantly.
        if let Some(executor) = &self.executor {
            executor.stop_threads();
        }

        Reply::success("user background activity stopped")
    }

    fn load_executor(&mut self) -> anyhow::Result<()> {
        let Some((path, ProjectKind::Scripted)) = self.project.clone() else {
            anyhow::bail!("no project recorded");
        };

        let publisher = self.publisher.clone();
        let push: PushFn = Arc::new(move |event, data| {
            publisher.publish(CallbackMessage::Push(PushMessage::new(event, data)));
        });

        let mut executor = ScriptExecutor::new(path, Some(push));
        executor.load()?;
        self.executor = Some(executor);

        Ok(())
    }

    /// Full teardown on shutdown or restart.
    pub fn shutdown(&mut self) {
        if let Some(mut executor) = self.executor.take() {
            executor.cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::INTERPRETER_LOCK;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use std::io::Write as _;
    use zip::write::SimpleFileOptions;

    fn archive_with_main(source: &str) -> String {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        writer
            .start_file("main.py", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(source.as_bytes()).unwrap();
        BASE64.encode(writer.finish().unwrap().into_inner())
    }

    async fn new_service(dir: &std::path::Path) -> (Service, robolink_ipc::CallbackSubscriber) {
        let socket = dir.join("callback.sock");
        let publisher = CallbackPublisher::bind(&socket).await.unwrap();
        let subscriber = robolink_ipc::CallbackSubscriber::connect(&socket)
            .await
            .unwrap();

        let storage = StorageConfig {
            root: dir.join("storage"),
        };

        (Service::new(&storage, publisher), subscriber)
    }

    const V1: &str = r#"
class C:
    def greet(self):
        return {"r": "hi"}
"#;

    const V2: &str = r#"
class C:
    def greet(self):
        return {"r": "hi2"}
"#;

    /// Cold start, upload, start, call: the first upload never restarts.
    #[tokio::test(flavor = "multi_thread")]
    async fn first_upload_start_and_call() {
        let _guard = INTERPRETER_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (mut service, _subscriber) = new_service(dir.path()).await;

        let reply = service.handle(Command::Update {
            archive: archive_with_main(V1),
        });
        assert!(reply.is_success(), "{reply:?}");
        let data = reply.data.unwrap();
        assert_eq!(data["worker_will_restart"], json!(false));
        assert_eq!(data["project_kind"], json!("scripted"));
        assert!(!service.restart_pending());

        let reply = service.handle(Command::Start);
        assert!(reply.is_success(), "{reply:?}");

        let reply = service.handle(Command::Process {
            object: "c".to_owned(),
            method: "greet".to_owned(),
            args: Map::new(),
        });
        assert_eq!(reply.result, Some(json!({"r": "hi"})));

        service.shutdown();
    }

    /// A second upload onto a loaded project schedules the restart.
    #[tokio::test(flavor = "multi_thread")]
    async fn second_upload_schedules_a_restart() {
        let _guard = INTERPRETER_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (mut service, _subscriber) = new_service(dir.path()).await;

        service.handle(Command::Update {
            archive: archive_with_main(V1),
        });
        assert!(service.handle(Command::Start).is_success());

        let reply = service.handle(Command::Update {
            archive: archive_with_main(V2),
        });
        assert!(reply.is_success(), "{reply:?}");
        assert_eq!(reply.data.unwrap()["worker_will_restart"], json!(true));
        assert!(service.restart_pending());

        service.shutdown();
    }

    /// A rejected archive must not disturb the running project.
    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_archive_keeps_the_previous_project_on_disk() {
        let _guard = INTERPRETER_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (mut service, _subscriber) = new_service(dir.path()).await;

        service.handle(Command::Update {
            archive: archive_with_main(V1),
        });

        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        writer
            .start_file("../evil.py", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"evil").unwrap();
        let bad = BASE64.encode(writer.finish().unwrap().into_inner());

        let reply = service.handle(Command::Update { archive: bad });
        assert_eq!(reply.error_code, Some(ErrorCode::ProjectSecurityViolation));

        // `start` still works against the untouched project.
        let reply = service.handle(Command::Start);
        assert!(reply.is_success(), "{reply:?}");

        service.shutdown();
    }

    /// Disconnect stops user activity but preserves the loaded context.
    #[tokio::test(flavor = "multi_thread")]
    async fn disconnect_preserves_the_instance_context() {
        let _guard = INTERPRETER_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (mut service, _subscriber) = new_service(dir.path()).await;

        service.handle(Command::Update {
            archive: archive_with_main(
                r#"
class Counter:
    def __init__(self):
        self.n = 0
        self.stopped = False

    def bump(self):
        self.n += 1
        return self.n

    def stop(self):
        self.stopped = True

    def was_stopped(self):
        return self.stopped
"#,
            ),
        });
        assert!(service.handle(Command::Start).is_success());

        let bump = |service: &mut Service| {
            service.handle(Command::Process {
                object: "counter".to_owned(),
                method: "bump".to_owned(),
                args: Map::new(),
            })
        };

        assert_eq!(bump(&mut service).result, Some(json!(1)));

        let reply = service.handle(Command::ClientDisconnected {
            session_id: "sess-1".to_owned(),
        });
        assert!(reply.is_success());

        // Same instance: the counter keeps its state and saw its stop hook.
        assert_eq!(bump(&mut service).result, Some(json!(2)));
        let reply = service.handle(Command::Process {
            object: "counter".to_owned(),
            method: "was_stopped".to_owned(),
            args: Map::new(),
        });
        assert_eq!(reply.result, Some(json!(true)));

        service.shutdown();
    }

    /// `process` with nothing on disk reports the missing project.
    #[tokio::test(flavor = "multi_thread")]
    async fn process_without_any_project_is_an_error() {
        let _guard = INTERPRETER_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (mut service, _subscriber) = new_service(dir.path()).await;

        let reply = service.handle(Command::Process {
            object: "c".to_owned(),
            method: "greet".to_owned(),
            args: Map::new(),
        });

        assert_eq!(reply.error_code, Some(ErrorCode::ProjectNotFound));
    }

    /// Pushes emitted by user code reach the callback subscriber.
    #[tokio::test(flavor = "multi_thread")]
    async fn pushes_flow_to_the_callback_channel() {
        let _guard = INTERPRETER_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (mut service, mut subscriber) = new_service(dir.path()).await;

        service.handle(Command::Update {
            archive: archive_with_main(
                r#"
class Beacon:
    def fire(self):
        push_message("flash", {"n": 1})
        return "fired"
"#,
            ),
        });
        assert!(service.handle(Command::Start).is_success());

        let reply = service.handle(Command::Process {
            object: "beacon".to_owned(),
            method: "fire".to_owned(),
            args: Map::new(),
        });
        assert_eq!(reply.result, Some(json!("fired")));

        let msg = subscriber
            .recv_timeout(std::time::Duration::from_secs(2))
            .await
            .unwrap()
            .expect("push should arrive");
        let CallbackMessage::Push(push) = msg else {
            panic!("expected a push message");
        };
        assert_eq!(push.event, "flash");
        assert_eq!(push.data, json!({"n": 1}));

        service.shutdown();
    }
}
