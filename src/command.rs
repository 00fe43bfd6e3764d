//! Shared step logic for cooperative peer commands.
//!
//! Concrete commands supply the protocol work, this layer supplies readiness
//! registration, deadline tracking and the single catch point for session
//! fatal errors.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use engine::{Command, Engine, StepResult};
use error::{PeerError, PeerErrorKind, PeerResult};
use peer::Peer;
use transport::{SocketId, Transport};

/// Readiness and deadline state every peer command carries.
pub struct CommandState {
    cuid: u64,
    addr: SocketAddr,
    read_check: Option<SocketId>,
    write_check: Option<SocketId>,
    checkpoint: Instant,
    timeout: Duration,
    no_check: bool,
    upload_limit_check: bool,
    upload_limit: u64,
    finished: bool,
}

impl CommandState {
    pub fn new(cuid: u64, addr: SocketAddr, timeout: Duration) -> CommandState {
        CommandState {
            cuid: cuid,
            addr: addr,
            read_check: None,
            write_check: None,
            checkpoint: Instant::now(),
            timeout: timeout,
            no_check: false,
            upload_limit_check: false,
            upload_limit: 0,
            finished: false,
        }
    }

    pub fn cuid(&self) -> u64 {
        self.cuid
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn read_check(&self) -> Option<SocketId> {
        self.read_check
    }

    pub fn write_check(&self) -> Option<SocketId> {
        self.write_check
    }

    /// Register read interest for the given socket.
    ///
    /// Re-registering the socket already held is a no-op, a different socket
    /// atomically swaps the registration, a closed socket deregisters.
    pub fn set_read_check(&mut self, engine: &Engine, socket: SocketId, open: bool) {
        if !open {
            self.disable_read_check(engine);
            return;
        }

        match self.read_check {
            Some(current) if current == socket => (),
            Some(current) => {
                engine.remove_read_interest(current, self.cuid);
                engine.add_read_interest(socket, self.cuid);
                self.read_check = Some(socket);
            }
            None => {
                engine.add_read_interest(socket, self.cuid);
                self.read_check = Some(socket);
            }
        }
    }

    pub fn disable_read_check(&mut self, engine: &Engine) {
        if let Some(current) = self.read_check.take() {
            engine.remove_read_interest(current, self.cuid);
        }
    }

    /// Register write interest for the given socket, with the same
    /// idempotence rules as [set_read_check].
    pub fn set_write_check(&mut self, engine: &Engine, socket: SocketId, open: bool) {
        if !open {
            self.disable_write_check(engine);
            return;
        }

        match self.write_check {
            Some(current) if current == socket => (),
            Some(current) => {
                engine.remove_write_interest(current, self.cuid);
                engine.add_write_interest(socket, self.cuid);
                self.write_check = Some(socket);
            }
            None => {
                engine.add_write_interest(socket, self.cuid);
                self.write_check = Some(socket);
            }
        }
    }

    pub fn disable_write_check(&mut self, engine: &Engine) {
        if let Some(current) = self.write_check.take() {
            engine.remove_write_interest(current, self.cuid);
        }
    }

    /// Mark progress, monotonically pushing the deadline checkpoint forward.
    pub fn reset_checkpoint(&mut self) {
        self.checkpoint = Instant::now();
    }

    pub fn timed_out(&self) -> bool {
        self.checkpoint.elapsed() >= self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn no_check(&self) -> bool {
        self.no_check
    }

    /// Force the command to run next pass regardless of socket readiness.
    pub fn set_no_check(&mut self, no_check: bool) {
        self.no_check = no_check;
    }

    pub fn upload_limit_check(&self) -> bool {
        self.upload_limit_check
    }

    /// Subject the next readiness evaluation to the upload rate ceiling.
    pub fn set_upload_limit_check(&mut self, check: bool) {
        self.upload_limit_check = check;
    }

    pub fn upload_limit(&self) -> u64 {
        self.upload_limit
    }

    pub fn set_upload_limit(&mut self, limit: u64) {
        self.upload_limit = limit;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn set_finished(&mut self) {
        self.finished = true;
    }
}

/// Capability interface of a cooperative peer command.
///
/// The blanket [Command] impl below wraps `step_inner` with the uniform
/// halt, progress, timeout and failure handling every session runs under.
pub trait PeerCommand {
    fn state(&self) -> &CommandState;

    fn state_mut(&mut self) -> &mut CommandState;

    fn peer(&self) -> &Peer;

    fn peer_mut(&mut self) -> &mut Peer;

    fn transport_mut(&mut self) -> &mut Transport;

    /// One non blocking step of protocol work.
    fn step_inner(&mut self, engine: &Engine) -> PeerResult<StepResult>;

    /// Hook run at the single catch point before generic peer penalty
    /// bookkeeping. Implementations release collaborator resources here.
    fn on_abort(&mut self, _err: &PeerError) {}

    /// Policy for what the scheduler sees after an abort.
    ///
    /// The default reschedules one last pass, which reports Done, so a
    /// higher layer gets a chance to replace the failed session with a
    /// fresh connection to another candidate peer.
    fn prepare_for_continue(&mut self, _engine: &Engine) -> StepResult {
        StepResult::Reschedule
    }

    /// Current upload rate used by the upload limit gate, zero when the
    /// command has no rate source.
    fn upload_rate(&self) -> u64 {
        0
    }
}

impl<T> Command for T
    where T: PeerCommand
{
    fn step(&mut self, engine: &Engine) -> StepResult {
        if engine.is_halted() || self.state().is_finished() {
            return StepResult::Done;
        }

        match guarded_step(self, engine) {
            Ok(result) => result,
            Err(err) => {
                error!("peer_wire: CUID#{} - Session with {} aborted; {}",
                       self.state().cuid(),
                       self.state().addr(),
                       err);

                self.on_abort(&err);

                self.state_mut().disable_read_check(engine);
                self.state_mut().disable_write_check(engine);
                engine.decrease_connections();

                let peer = self.peer_mut();
                peer.mark_error();
                peer.reset_transient_status();
                peer.deactivate();

                debug!("peer_wire: CUID#{} - Peer {} banned...",
                       self.state().cuid(),
                       self.state().addr());

                self.state_mut().set_finished();
                self.prepare_for_continue(engine)
            }
        }
    }
}

/// Progress and deadline gate run before any protocol work.
fn guarded_step<T>(command: &mut T, engine: &Engine) -> PeerResult<StepResult>
    where T: PeerCommand + ?Sized
{
    let no_check = command.state().no_check();
    let upload_limit_check = command.state().upload_limit_check();
    let upload_limit = command.state().upload_limit();
    let check_read = command.state().read_check().is_some();
    let check_write = command.state().write_check().is_some();

    let upload_allowed = !upload_limit_check || upload_limit == 0 || command.upload_rate() <= upload_limit;

    // Both gates are one shot, the step's tail re-arms them as needed.
    command.state_mut().set_no_check(false);
    command.state_mut().set_upload_limit_check(false);

    let mut progressed = no_check && upload_allowed;
    if !progressed && check_read {
        progressed = command.transport_mut().poll_readable().unwrap_or(false);
    }
    if !progressed && check_write {
        progressed = command.transport_mut().poll_writable().unwrap_or(false);
    }

    if progressed {
        command.state_mut().reset_checkpoint();
    }

    if command.state().timed_out() {
        return Err(PeerError::new(PeerErrorKind::Timeout,
                                  "No Readiness Progress Within The Session Deadline"));
    }

    command.step_inner(engine)
}
