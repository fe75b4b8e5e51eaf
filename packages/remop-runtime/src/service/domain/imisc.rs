//! IMISC performer: the miscellaneous network services behind each IMISC
//! operation.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use remop_core::imisc::{
    self, CharGen, Data, Echo, Empty, Finger, GenResult, GenTime, Ia5List, ImiscError, Ping,
    PwdGen, Qotd, Sink, TellUser, TimeOfDay, TimeResult, Users, UtcResult, UtcTime,
};
use remop_core::{Clock, OperationCode, OperationTable, RemoteOperation, SystemClock};

use crate::service::registry::{ManagedService, ServiceContext};
use crate::service::router::{OperationRouter, RegistrationError};

/// Characters cycled by `charGen`: printable ASCII, space through tilde.
const CHARGEN_ALPHABET: &[u8] =
    b" !\"#$%&'()*+,-./0123456789:;<=>?@ABCDEFGHIJKLMNOPQRSTUVWXYZ[\\]^_`abcdefghijklmnopqrstuvwxyz{|}~";
const CHARGEN_LINE_WIDTH: usize = 72;

const CONSONANTS: &[u8] = b"bcdfghjkmnprstvwz";
const VOWELS: &[u8] = b"aeiou";

// ---------------------------------------------------------------------------
// ImiscConfig
// ---------------------------------------------------------------------------

/// Configuration of the IMISC performer.
#[derive(Clone)]
pub struct ImiscConfig {
    /// Users reported as logged in; also the valid `tellUser` recipients.
    pub users: Vec<String>,
    /// Quotes served by `qotd`. Multi-line quotes are split on `\n`.
    pub quotes: Vec<String>,
    /// Lines per `charGen` reply.
    pub chargen_lines: usize,
    /// Passwords per `pwdGen` reply.
    pub password_count: usize,
    pub password_length: usize,
    /// Messages held per user before `tellUser` reports congestion.
    pub mailbox_capacity: usize,
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ImiscConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImiscConfig")
            .field("users", &self.users)
            .field("quotes", &self.quotes.len())
            .field("chargen_lines", &self.chargen_lines)
            .field("password_count", &self.password_count)
            .field("password_length", &self.password_length)
            .field("mailbox_capacity", &self.mailbox_capacity)
            .finish_non_exhaustive()
    }
}

impl Default for ImiscConfig {
    fn default() -> Self {
        Self {
            users: Vec::new(),
            quotes: Vec::new(),
            chargen_lines: 10,
            password_count: 6,
            password_length: 8,
            mailbox_capacity: 16,
            clock: Arc::new(SystemClock),
        }
    }
}

// ---------------------------------------------------------------------------
// ImiscService
// ---------------------------------------------------------------------------

/// Performs the IMISC operations.
pub struct ImiscService {
    config: ImiscConfig,
    chargen_offset: AtomicUsize,
    mailboxes: Mutex<HashMap<String, VecDeque<Vec<String>>>>,
    sunk_bytes: AtomicU64,
}

impl ImiscService {
    #[must_use]
    pub fn new(config: ImiscConfig) -> Self {
        Self {
            config,
            chargen_offset: AtomicUsize::new(0),
            mailboxes: Mutex::new(HashMap::new()),
            sunk_bytes: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ImiscConfig {
        &self.config
    }

    /// Router with a handler for every IMISC operation.
    ///
    /// # Errors
    ///
    /// Returns `RegistrationError` if `table` is not the IMISC table.
    pub fn router(self: &Arc<Self>, table: Arc<OperationTable>) -> Result<OperationRouter, RegistrationError> {
        let mut router = OperationRouter::new(table);
        self.route::<UtcTime>(&mut router, |s, _| Ok(s.utc_time()))?;
        self.route::<TimeOfDay>(&mut router, |s, _| Ok(s.time_of_day()))?;
        self.route::<Users>(&mut router, |s, _| Ok(s.users()))?;
        self.route::<CharGen>(&mut router, |s, _| Ok(s.char_gen()))?;
        self.route::<Qotd>(&mut router, |s, _| s.qotd())?;
        self.route::<Finger>(&mut router, |s, names| s.finger(&names))?;
        self.route::<PwdGen>(&mut router, |s, _| Ok(s.pwd_gen()))?;
        self.route::<GenTime>(&mut router, |s, _| Ok(s.gen_time()))?;
        self.route::<TellUser>(&mut router, |s, message| s.tell_user(message))?;
        self.route::<Ping>(&mut router, |_, _| Ok(Empty))?;
        self.route::<Sink>(&mut router, |s, data| Ok(s.sink(&data)))?;
        self.route::<Echo>(&mut router, |_, data| Ok(data))?;
        Ok(router)
    }

    fn route<Op: RemoteOperation>(
        self: &Arc<Self>,
        router: &mut OperationRouter,
        perform: fn(&ImiscService, Op::Argument) -> Result<Op::Result, ImiscError>,
    ) -> Result<(), RegistrationError> {
        let service = Arc::clone(self);
        router.handle::<Op, _, _, ImiscError>(move |ctx, argument| {
            let outcome = perform(&service, argument);
            if let Err(err) = &outcome {
                tracing::debug!(invoke_id = %ctx.invoke_id, operation = ctx.operation_name, error = %err, "imisc error");
            }
            std::future::ready(outcome)
        })?;
        Ok(())
    }

    // -- time ---------------------------------------------------------------

    #[must_use]
    pub fn utc_time(&self) -> UtcResult {
        UtcResult::from_datetime(&self.config.clock.now())
    }

    #[must_use]
    pub fn time_of_day(&self) -> TimeResult {
        TimeResult::from_datetime(&self.config.clock.now())
    }

    #[must_use]
    pub fn gen_time(&self) -> GenResult {
        GenResult::from_datetime(&self.config.clock.now())
    }

    // -- users --------------------------------------------------------------

    #[must_use]
    pub fn users(&self) -> Ia5List {
        Ia5List::lossy(&self.config.users)
    }

    fn is_logged_in(&self, name: &str) -> bool {
        self.config.users.iter().any(|u| u == name)
    }

    /// One line per named user, or per logged-in user when `names` is empty.
    ///
    /// # Errors
    ///
    /// `UserNotLoggedIn` listing every named user who is not logged in.
    pub fn finger(&self, names: &Ia5List) -> Result<Ia5List, ImiscError> {
        let names: Vec<&String> = if names.is_empty() {
            self.config.users.iter().collect()
        } else {
            names.iter().collect()
        };

        let absent: Vec<&String> = names.iter().copied().filter(|n| !self.is_logged_in(n)).collect();
        if !absent.is_empty() {
            return Err(ImiscError::UserNotLoggedIn(Ia5List::lossy(absent)));
        }

        let mailboxes = self.mailboxes.lock();
        Ok(Ia5List::lossy(names.into_iter().map(|name| {
            let waiting = mailboxes.get(name).map_or(0, VecDeque::len);
            format!("Login: {name}\tMessages: {waiting}")
        })))
    }

    /// Queues `message` for the user named by its first element.
    ///
    /// # Errors
    ///
    /// `UserNotLoggedIn` for an empty message or an unknown recipient,
    /// `Congested` when the recipient's mailbox is full.
    pub fn tell_user(&self, message: Ia5List) -> Result<Empty, ImiscError> {
        let mut lines = message.into_vec().into_iter();
        let Some(recipient) = lines.next() else {
            return Err(ImiscError::UserNotLoggedIn(Ia5List::default()));
        };
        if !self.is_logged_in(&recipient) {
            return Err(ImiscError::UserNotLoggedIn(Ia5List::lossy([recipient])));
        }

        let mut mailboxes = self.mailboxes.lock();
        let mailbox = mailboxes.entry(recipient).or_default();
        if mailbox.len() >= self.config.mailbox_capacity {
            return Err(ImiscError::Congested);
        }
        mailbox.push_back(lines.collect());
        Ok(Empty)
    }

    /// Removes and returns the messages waiting for `user`, oldest first.
    pub fn take_messages(&self, user: &str) -> Vec<Vec<String>> {
        self.mailboxes
            .lock()
            .remove(user)
            .map(Vec::from)
            .unwrap_or_default()
    }

    // -- generators ---------------------------------------------------------

    /// The next `chargen_lines` lines of the rotating character pattern.
    #[must_use]
    pub fn char_gen(&self) -> Ia5List {
        let count = self.config.chargen_lines;
        let start = self.chargen_offset.fetch_add(count, Ordering::Relaxed);
        Ia5List::lossy((start..start + count).map(chargen_line))
    }

    /// # Errors
    ///
    /// `UnableToOpenFile` when no quotes are configured.
    pub fn qotd(&self) -> Result<Ia5List, ImiscError> {
        if self.config.quotes.is_empty() {
            return Err(ImiscError::UnableToOpenFile(Ia5List::lossy(["qotd"])));
        }
        let index = rand::rng().random_range(0..self.config.quotes.len());
        Ok(Ia5List::lossy(self.config.quotes[index].lines()))
    }

    #[must_use]
    pub fn pwd_gen(&self) -> Ia5List {
        let mut rng = rand::rng();
        Ia5List::lossy((0..self.config.password_count).map(|_| {
            (0..self.config.password_length)
                .map(|i| {
                    let pool = if i % 2 == 0 { CONSONANTS } else { VOWELS };
                    char::from(pool[rng.random_range(0..pool.len())])
                })
                .collect::<String>()
        }))
    }

    // -- data ---------------------------------------------------------------

    pub fn sink(&self, data: &Data) -> Empty {
        let len = data.encoded_len() as u64;
        self.sunk_bytes.fetch_add(len, Ordering::Relaxed);
        metrics::counter!("remop_imisc_sink_bytes_total").increment(len);
        Empty
    }

    /// Bytes discarded by `sink` since start or the last reset.
    #[must_use]
    pub fn sunk_bytes(&self) -> u64 {
        self.sunk_bytes.load(Ordering::Relaxed)
    }
}

/// Line `n` of the RFC 864 pattern: 72 characters starting `n` places into
/// the alphabet.
fn chargen_line(n: usize) -> String {
    (0..CHARGEN_LINE_WIDTH)
        .map(|i| char::from(CHARGEN_ALPHABET[(n + i) % CHARGEN_ALPHABET.len()]))
        .collect()
}

#[async_trait]
impl ManagedService for ImiscService {
    fn name(&self) -> &'static str {
        "imisc"
    }

    fn operations(&self) -> Vec<OperationCode> {
        imisc::table().operations().map(|d| d.code).collect()
    }

    async fn init(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        if ctx.table.module() != imisc::MODULE {
            anyhow::bail!(
                "imisc service needs the {} table, got {}",
                imisc::MODULE,
                ctx.table.module()
            );
        }
        for expected in imisc::table().operations() {
            if ctx.table.get(expected.code) != Some(expected) {
                anyhow::bail!("table entry for {} does not match IMISC", expected.name);
            }
        }
        tracing::info!(
            users = self.config.users.len(),
            quotes = self.config.quotes.len(),
            "imisc service initialized"
        );
        Ok(())
    }

    async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
        let undelivered: usize = self.mailboxes.lock().values().map(VecDeque::len).sum();
        tracing::info!(undelivered, "imisc service stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
