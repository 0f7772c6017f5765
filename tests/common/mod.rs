use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use archon::store::StoreKind;
use archon::task::{Config, ContainerRuntime, ContainerSummary, DockerError};
use archon::worker::{self, Worker};

/// Container runtime double: containers exist only as counters and a
/// configurable inspect answer.
#[derive(Default)]
pub struct FakeRuntime {
    pub fail_run: bool,
    pub started: AtomicUsize,
    pub stopped: AtomicUsize,
    pub inspect_result: StdMutex<Option<ContainerSummary>>,
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn run(&self, _config: &Config) -> Result<String, DockerError> {
        if self.fail_run {
            return Err(DockerError::Start("runtime offline".to_string()));
        }
        let n = self.started.fetch_add(1, Ordering::SeqCst);
        Ok(format!("fake-container-{n}"))
    }

    async fn stop(&self, _container_id: &str) -> Result<(), DockerError> {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, _container_id: &str) -> Result<(), DockerError> {
        Ok(())
    }

    async fn inspect(&self, _container_id: &str) -> Result<Option<ContainerSummary>, DockerError> {
        Ok(self.inspect_result.lock().unwrap().clone())
    }
}

/// Bind a worker API on an ephemeral port and return the shared worker plus
/// its host:port name.
pub async fn spawn_worker(runtime: Arc<FakeRuntime>) -> (Arc<Mutex<Worker>>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let name = format!("127.0.0.1:{}", addr.port());

    let worker = Arc::new(Mutex::new(
        Worker::new(&name, StoreKind::Memory, runtime).unwrap(),
    ));
    let app = worker::api::router(worker.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (worker, name)
}
