//! Buffered pipelines and `MULTI`/`WATCH`/`EXEC` transactions.
use std::time::Duration;

use crate::aio::ConnectionLike;
use crate::cluster::ClusterClient;
use crate::cmd::{cmd, Cmd, ToRedisArgs};
use crate::types::{ErrorKind, RedisError, RedisResult, Value};

/// A buffered batch of commands bound to one connection for its whole
/// lifetime, so that an immediate `WATCH` and the later `MULTI`/`EXEC`
/// are guaranteed to land on the same socket.
///
/// Built up with [`Pipeline::cmd`]/[`Pipeline::arg`] the same way a single
/// [`Cmd`] is, then either run buffered (default) or wrapped in a
/// transaction via [`Pipeline::atomic`].
pub struct Pipeline<C> {
    conn: C,
    commands: Vec<Cmd>,
    transaction_mode: bool,
}

impl<C: ConnectionLike> Pipeline<C> {
    pub fn new(conn: C) -> Self {
        Pipeline { conn, commands: Vec::new(), transaction_mode: false }
    }

    /// Enables `MULTI`/`EXEC` wrapping for this pipeline's `execute()`.
    pub fn atomic(&mut self) -> &mut Self {
        self.transaction_mode = true;
        self
    }

    /// Starts a new queued command.
    pub fn cmd(&mut self, name: &str) -> &mut Self {
        self.commands.push(cmd(name));
        self
    }

    /// Appends an argument to the command most recently started with
    /// [`Pipeline::cmd`].
    ///
    /// # Panics
    /// Panics if called before any `cmd()`.
    pub fn arg<T: ToRedisArgs>(&mut self, arg: T) -> &mut Self {
        self.commands.last_mut().expect("Pipeline::arg called before Pipeline::cmd").arg(arg);
        self
    }

    /// Queues an already-built command.
    pub fn add_command(&mut self, command: Cmd) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Sends `WATCH key...` immediately, ahead of the eventual
    /// `MULTI`/`EXEC`, on the same connection this pipeline will later use
    /// to execute. Per the wire protocol, a `WATCH` after `MULTI` has
    /// begun is an error, so this must be called before queuing.
    pub async fn watch(&mut self, keys: &[&str]) -> RedisResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut watch = cmd("WATCH");
        for key in keys {
            watch.arg(*key);
        }
        self.conn.req_packed_command(&watch).await?;
        Ok(())
    }

    pub async fn unwatch(&mut self) -> RedisResult<()> {
        self.conn.req_packed_command(&cmd("UNWATCH")).await?;
        Ok(())
    }

    /// Writes every queued command in one buffer and reads back the
    /// responses in order; an I/O failure between the write and any read
    /// fails the whole pipeline rather than returning a partial result.
    ///
    /// In transactional mode the batch is wrapped in `MULTI`/`EXEC`: a
    /// null `EXEC` reply (an aborted transaction, typically because a
    /// watched key changed) becomes [`ErrorKind::WatchError`], and any
    /// other failure mid-transaction sends `DISCARD` before propagating
    /// the error.
    pub async fn execute(&mut self) -> RedisResult<Vec<Value>> {
        let commands = std::mem::take(&mut self.commands);
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        if !self.transaction_mode {
            return self.conn.req_packed_commands(&commands, 0, commands.len()).await;
        }

        let mut batch = Vec::with_capacity(commands.len() + 2);
        batch.push(cmd("MULTI"));
        let queued_len = commands.len();
        batch.extend(commands);
        batch.push(cmd("EXEC"));

        // Skip MULTI's own ack plus one QUEUED ack per queued command;
        // only the EXEC reply is wanted.
        match self.conn.req_packed_commands(&batch, queued_len + 1, 1).await {
            Ok(mut results) => match results.pop() {
                Some(Value::Nil) => {
                    Err(RedisError::from((ErrorKind::WatchError, "transaction aborted: a watched key changed before EXEC")))
                }
                Some(Value::Bulk(items)) => Ok(items),
                Some(_) => Err(RedisError::from((ErrorKind::ResponseError, "EXEC reply was neither an array nor nil"))),
                None => Ok(Vec::new()),
            },
            Err(err) => {
                let _ = self.conn.req_packed_command(&cmd("DISCARD")).await;
                Err(err)
            }
        }
    }
}

/// Runs `func` against a fresh [`Pipeline`] wrapped in `WATCH`/`MULTI`/
/// `EXEC`, retrying the whole thing whenever the transaction aborts
/// because a watched key changed, optionally pausing `watch_delay`
/// between attempts.
///
/// `func` only queues commands onto the pipeline; it must not itself
/// execute anything, since the queued commands are not sent until the
/// closing `EXEC`.
pub async fn transaction<C, F>(mut conn: C, watches: &[&str], watch_delay: Option<Duration>, mut func: F) -> RedisResult<Vec<Value>>
where
    C: ConnectionLike,
    F: FnMut(&mut Pipeline<&mut C>) -> RedisResult<()>,
{
    loop {
        let mut pipe = Pipeline::new(&mut conn);
        pipe.atomic();
        pipe.watch(watches).await?;
        func(&mut pipe)?;

        match pipe.execute().await {
            Ok(values) => return Ok(values),
            Err(err) if err.kind() == ErrorKind::WatchError => {
                if let Some(delay) = watch_delay {
                    tokio::time::sleep(delay).await;
                }
                continue;
            }
            Err(err) => return Err(err),
        }
    }
}

/// A pipeline that resolves the slot of every key-touching command it
/// queues and refuses to mix commands whose keys hash to different
/// slots, since a real `MULTI`/`EXEC` batch can only be sent to the one
/// node that owns all of it.
#[derive(Debug)]
pub struct ClusterPipeline {
    commands: Vec<Cmd>,
    transaction_mode: bool,
    slot: Option<u16>,
}

impl ClusterPipeline {
    pub fn new() -> Self {
        ClusterPipeline { commands: Vec::new(), transaction_mode: false, slot: None }
    }

    pub fn atomic(&mut self) -> &mut Self {
        self.transaction_mode = true;
        self
    }

    /// Queues `command`, hashing any keys it touches and rejecting it if
    /// they land on a slot other than the one already committed to by an
    /// earlier command in this pipeline.
    pub fn add_command(&mut self, command: Cmd) -> RedisResult<&mut Self> {
        let keys = command.keys();
        if !keys.is_empty() {
            if let Some(slot) = crate::cluster::slot_for_keys(&keys)? {
                match self.slot {
                    None => self.slot = Some(slot),
                    Some(bound) if bound != slot => {
                        return Err(RedisError::from((
                            ErrorKind::CrossSlot,
                            "pipeline commands hash to more than one cluster slot",
                        )));
                    }
                    Some(_) => {}
                }
            }
        }
        self.commands.push(command);
        Ok(self)
    }

    pub fn cmd(&mut self, name: &str) -> Cmd {
        cmd(name)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Acquires a connection to the node owning this pipeline's slot (or
    /// any master, for an all-keyless batch) and runs the batch exactly
    /// as [`Pipeline::execute`] would.
    pub async fn execute(&mut self, client: &ClusterClient) -> RedisResult<Vec<Value>> {
        let commands = std::mem::take(&mut self.commands);
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let conn = client.acquire(self.slot).await?;
        let mut pipe = Pipeline { conn, commands, transaction_mode: self.transaction_mode };
        pipe.execute().await
    }
}

impl Default for ClusterPipeline {
    fn default() -> Self {
        Self::new()
    }
}
