use std::{convert::Infallible, io, net::SocketAddr, sync::Arc};

use comms::specs::{ClusterSpec, PS_JOB};
use log::{debug, info, warn};
use tokio::{net::TcpListener, task::JoinSet};

use crate::{ServerErr, service::serve, storage::VariableStore};

/// A coordination endpoint bound to its cluster address.
///
/// It only ever accepts sessions, it never dials other members of the cluster.
pub struct ParameterServer {
    task: usize,
    listener: TcpListener,
    store: Arc<VariableStore>,
    sessions: JoinSet<io::Result<()>>,
}

impl ParameterServer {
    /// Binds the coordination endpoint of `task` to its address in `cluster`.
    ///
    /// # Arguments
    /// * `cluster` - The cluster topology.
    /// * `task` - The task index of this endpoint inside the `ps` job.
    ///
    /// # Returns
    /// A bound `ParameterServer` or a `ServerErr` if the task has no address or
    /// the address can't be bound.
    pub async fn bind(cluster: &ClusterSpec, task: usize) -> Result<Self, ServerErr> {
        let addr = cluster.task_address(PS_JOB, task)?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerErr::Bind {
                addr: addr.to_string(),
                source,
            })?;

        info!(task = task, addr = addr; "parameter server started");

        Ok(Self {
            task,
            listener,
            store: Arc::new(VariableStore::new()),
            sessions: JoinSet::new(),
        })
    }

    /// Returns the address this endpoint is listening on.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Returns a handle to the hosted store.
    pub fn store(&self) -> Arc<VariableStore> {
        Arc::clone(&self.store)
    }

    /// Serves worker sessions for the rest of the process lifetime.
    ///
    /// This call never returns, the endpoint is torn down from the outside by
    /// dropping the future, e.g. when the process receives a signal. Failed accepts
    /// and sessions are logged and don't stop the endpoint.
    pub async fn join(mut self) -> Infallible {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn(stream, peer),
                    Err(e) => warn!(task = self.task; "failed to accept a session: {e}"),
                },
                Some(joined) = self.sessions.join_next() => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(task = self.task; "session failed: {e}"),
                    Err(e) => warn!(task = self.task; "session task failed: {e}"),
                },
            }
        }
    }

    fn spawn(&mut self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        debug!(task = self.task; "accepted connection from {peer}");

        if let Err(e) = stream.set_nodelay(true) {
            warn!(task = self.task; "failed to disable nagle for {peer}: {e}");
        }

        let (rx, tx) = stream.into_split();
        let (rx, tx) = comms::channel(rx, tx);
        let store = Arc::clone(&self.store);

        self.sessions.spawn(serve(self.task, store, rx, tx));
    }
}
