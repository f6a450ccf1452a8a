//! Command construction and RESP encoding.
use crate::types::{ErrorKind, RedisError, RedisResult};

/// One argument of a command, already reduced to bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Arg(Vec<u8>);

impl Arg {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Anything that can be turned into one or more command arguments.
///
/// Scalars produce a single argument; slices/vectors produce one argument
/// per element. Booleans are rejected unless the caller opts in via
/// [`Cmd::arg_bool_as_int`], matching the spec's requirement that bare
/// booleans be a client-side encoding error.
pub trait ToRedisArgs {
    fn write_redis_args(&self, out: &mut Vec<Arg>);
}

macro_rules! impl_to_redis_args_display {
    ($($ty:ty),*) => {
        $(
            impl ToRedisArgs for $ty {
                fn write_redis_args(&self, out: &mut Vec<Arg>) {
                    out.push(Arg(self.to_string().into_bytes()));
                }
            }
        )*
    };
}

impl_to_redis_args_display!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64);

impl ToRedisArgs for &str {
    fn write_redis_args(&self, out: &mut Vec<Arg>) {
        out.push(Arg(self.as_bytes().to_vec()));
    }
}

impl ToRedisArgs for String {
    fn write_redis_args(&self, out: &mut Vec<Arg>) {
        out.push(Arg(self.as_bytes().to_vec()));
    }
}

impl ToRedisArgs for Vec<u8> {
    fn write_redis_args(&self, out: &mut Vec<Arg>) {
        out.push(Arg(self.clone()));
    }
}

impl ToRedisArgs for &[u8] {
    fn write_redis_args(&self, out: &mut Vec<Arg>) {
        out.push(Arg(self.to_vec()));
    }
}

impl<T: ToRedisArgs> ToRedisArgs for &T {
    fn write_redis_args(&self, out: &mut Vec<Arg>) {
        (*self).write_redis_args(out)
    }
}

/// A multi-argument sequence, distinct from `Vec<u8>`/`&[u8]` above which
/// are treated as a single binary-safe argument.
pub struct Many<T>(pub Vec<T>);

impl<T: ToRedisArgs> ToRedisArgs for Many<T> {
    fn write_redis_args(&self, out: &mut Vec<Arg>) {
        for item in &self.0 {
            item.write_redis_args(out);
        }
    }
}

impl ToRedisArgs for Vec<String> {
    fn write_redis_args(&self, out: &mut Vec<Arg>) {
        for item in self {
            item.write_redis_args(out);
        }
    }
}

impl ToRedisArgs for &[&str] {
    fn write_redis_args(&self, out: &mut Vec<Arg>) {
        for item in self.iter() {
            item.write_redis_args(out);
        }
    }
}

/// A single Redis command: a command name plus an ordered argument vector.
/// Built up with [`cmd`] and [`Cmd::arg`], then encoded once per send.
#[derive(Clone, Debug, Default)]
pub struct Cmd {
    args: Vec<Arg>,
    cursor_arg: Option<usize>,
}

/// How a command's key argument(s) are laid out among its arguments, for
/// cluster slot routing. Grounded in each command's well-known key
/// position rather than the corpus (no per-command keyspec table survived
/// filtering into `original_source/`); covers the commands the
/// specification's worked examples and their obvious siblings exercise.
/// Anything not listed defaults to `First`, which is correct for the
/// overwhelming majority of single-key commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum KeyLayout {
    /// No routable key (admin/pubsub/transaction-control commands).
    None,
    /// Exactly the first argument; everything after is values/options.
    First,
    /// The first `n` arguments (`RENAME src dst`, `COPY src dst`,
    /// `SMOVE src dst member` truncated to its 2 real keys).
    FirstN(usize),
    /// The first argument is not a key (`BITOP op`); every argument
    /// after it is.
    SkipFirstThenAll,
    /// Keys at even positions, values at odd (`MSET`, `MSETNX`).
    Alternating,
    /// Every argument is a key (`DEL`, `MGET`, `EXISTS`, set-algebra
    /// commands whose destination is itself a key).
    All,
}

fn key_layout(name: &str) -> KeyLayout {
    match name {
        "PING" | "INFO" | "CLIENT" | "CLUSTER" | "ECHO" | "CONFIG" | "DBSIZE" | "FLUSHALL" | "FLUSHDB" | "SELECT"
        | "AUTH" | "HELLO" | "MULTI" | "EXEC" | "DISCARD" | "UNWATCH" | "ASKING" | "SCRIPT" | "SHUTDOWN"
        | "SUBSCRIBE" | "PSUBSCRIBE" | "UNSUBSCRIBE" | "PUNSUBSCRIBE" | "PUBLISH" | "SCAN" => KeyLayout::None,

        "DEL" | "UNLINK" | "EXISTS" | "MGET" | "WATCH" | "TOUCH" | "PFCOUNT" | "PFMERGE" | "SUNION" | "SINTER"
        | "SDIFF" | "SUNIONSTORE" | "SINTERSTORE" | "SDIFFSTORE" => KeyLayout::All,

        "MSET" | "MSETNX" => KeyLayout::Alternating,

        "RENAME" | "RENAMENX" | "COPY" | "SMOVE" | "RPOPLPUSH" | "LMOVE" | "LCS" | "GEOSEARCHSTORE"
        | "ZRANGESTORE" => KeyLayout::FirstN(2),

        "BITOP" => KeyLayout::SkipFirstThenAll,

        _ => KeyLayout::First,
    }
}

/// Starts building a new command with the given (upper-case) name.
pub fn cmd(name: &str) -> Cmd {
    let mut c = Cmd::new();
    c.args.push(Arg(name.as_bytes().to_vec()));
    c
}

impl Cmd {
    pub fn new() -> Cmd {
        Cmd { args: Vec::new(), cursor_arg: None }
    }

    /// Appends one more argument, expanding slices/vecs into multiple
    /// wire arguments.
    pub fn arg<T: ToRedisArgs>(&mut self, arg: T) -> &mut Self {
        arg.write_redis_args(&mut self.args);
        self
    }

    /// Appends a boolean, explicitly opted into as `"1"`/`"0"` rather than
    /// being rejected as a bare bool would be.
    pub fn arg_bool_as_int(&mut self, value: bool) -> &mut Self {
        self.args.push(Arg(if value { b"1".to_vec() } else { b"0".to_vec() }));
        self
    }

    /// Marks the most recently added argument as the cursor for a `SCAN`
    /// family command, so `scan_iter` can rewrite it between pages.
    pub fn mark_cursor_arg(&mut self) -> &mut Self {
        self.cursor_arg = Some(self.args.len() - 1);
        self
    }

    pub fn set_cursor(&mut self, cursor: &str) {
        if let Some(idx) = self.cursor_arg {
            self.args[idx] = Arg(cursor.as_bytes().to_vec());
        }
    }

    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    /// The command name, i.e. the first argument, upper-cased.
    pub fn name(&self) -> String {
        self.args
            .first()
            .map(|a| String::from_utf8_lossy(a.as_bytes()).to_uppercase())
            .unwrap_or_default()
    }

    /// The key argument(s) this command touches, used by the cluster
    /// router and `ClusterPipeline` for slot computation. Looked up from
    /// each command's well-known key layout (`key_layout`) rather than
    /// treating every argument after the name as a key, so a value-bearing
    /// single-key command (`SET key value`, `RPUSH key v1 v2`) hashes only
    /// its key instead of its values too. Commands with an explicit
    /// numeric key count (`EVAL`, `ZINTERSTORE`) are better served by
    /// [`Cmd::keys_with_count`], which this falls back to being a rough
    /// approximation of for anything not listed in `key_layout`.
    pub fn keys(&self) -> Vec<&[u8]> {
        let args = || self.args.iter().skip(1).map(|a| a.as_bytes());
        match key_layout(&self.name()) {
            KeyLayout::None => Vec::new(),
            KeyLayout::First => args().take(1).collect(),
            KeyLayout::FirstN(n) => args().take(n).collect(),
            KeyLayout::SkipFirstThenAll => args().skip(1).collect(),
            KeyLayout::Alternating => args().step_by(2).collect(),
            KeyLayout::All => args().collect(),
        }
    }

    /// Extracts the `numkeys` keys following the given starting position,
    /// as used by `EVAL`/`EVALSHA`/`ZINTERSTORE`/`ZUNIONSTORE`-style
    /// commands that pass an explicit key count.
    pub fn keys_with_count(&self, first_key_pos: usize, numkeys: usize) -> Vec<&[u8]> {
        self.args
            .iter()
            .skip(first_key_pos)
            .take(numkeys)
            .map(|a| a.as_bytes())
            .collect()
    }

    /// Total encoded byte length, used to preallocate the write buffer.
    pub fn encoded_len(&self) -> usize {
        let mut total = format!("*{}\r\n", self.args.len()).len();
        for arg in &self.args {
            total += format!("${}\r\n", arg.as_bytes().len()).len();
            total += arg.as_bytes().len() + 2;
        }
        total
    }

    /// Encodes this command as a RESP array into `out`, appending rather
    /// than replacing so pipelines can share one scratch buffer.
    pub fn write_packed_command(&self, out: &mut Vec<u8>) {
        out.reserve(self.encoded_len());
        out.extend_from_slice(format!("*{}\r\n", self.args.len()).as_bytes());
        for arg in &self.args {
            let bytes = arg.as_bytes();
            out.extend_from_slice(format!("${}\r\n", bytes.len()).as_bytes());
            out.extend_from_slice(bytes);
            out.extend_from_slice(b"\r\n");
        }
    }

    pub fn get_packed_command(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.write_packed_command(&mut out);
        out
    }

    /// Validates that no argument was built from a bare boolean encoding
    /// mistake; reserved for future argument kinds that need rejecting.
    pub fn validate(&self) -> RedisResult<()> {
        if self.args.is_empty() {
            return Err(RedisError::from((ErrorKind::ClientError, "empty command")));
        }
        Ok(())
    }
}
