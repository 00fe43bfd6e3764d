//! Single threaded cooperative scheduler contract consumed by peer commands.

use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};
use std::thread;
use std::time::Duration;

use transport::SocketId;

/// Outcome of one non blocking command step.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StepResult {
    /// The command must run again on a later scheduler pass.
    Reschedule,
    /// The command finished and leaves the scheduler.
    Done,
}

/// Unit of cooperative scheduling.
///
/// A step is invoked at most once per scheduler pass and must never block,
/// all state needed to resume lives in the command itself.
pub trait Command {
    fn step(&mut self, engine: &Engine) -> StepResult;
}

/// Scheduler owning the ready queue and the readiness interest tables.
///
/// Interest tables use interior mutability so a command can swap its own
/// entries mid step without touching another command's entries; the run loop
/// itself stays single threaded.
pub struct Engine {
    read_interests: RefCell<HashSet<(SocketId, u64)>>,
    write_interests: RefCell<HashSet<(SocketId, u64)>>,
    ready: RefCell<VecDeque<Box<Command>>>,
    halted: Cell<bool>,
    connections: Cell<usize>,
    next_cuid: Cell<u64>,
}

impl Engine {
    pub fn new() -> Engine {
        Engine {
            read_interests: RefCell::new(HashSet::new()),
            write_interests: RefCell::new(HashSet::new()),
            ready: RefCell::new(VecDeque::new()),
            halted: Cell::new(false),
            connections: Cell::new(0),
            next_cuid: Cell::new(1),
        }
    }

    /// Allocate a unique identifier for a new command.
    pub fn new_cuid(&self) -> u64 {
        let cuid = self.next_cuid.get();
        self.next_cuid.set(cuid + 1);

        cuid
    }

    /// Register a command's read interest for the given socket.
    ///
    /// Registering an interest that is already present is a no-op.
    pub fn add_read_interest(&self, socket: SocketId, cuid: u64) {
        self.read_interests.borrow_mut().insert((socket, cuid));
    }

    pub fn remove_read_interest(&self, socket: SocketId, cuid: u64) {
        self.read_interests.borrow_mut().remove(&(socket, cuid));
    }

    /// Register a command's write interest for the given socket.
    ///
    /// Registering an interest that is already present is a no-op.
    pub fn add_write_interest(&self, socket: SocketId, cuid: u64) {
        self.write_interests.borrow_mut().insert((socket, cuid));
    }

    pub fn remove_write_interest(&self, socket: SocketId, cuid: u64) {
        self.write_interests.borrow_mut().remove(&(socket, cuid));
    }

    pub fn has_read_interest(&self, socket: SocketId, cuid: u64) -> bool {
        self.read_interests.borrow().contains(&(socket, cuid))
    }

    pub fn has_write_interest(&self, socket: SocketId, cuid: u64) -> bool {
        self.write_interests.borrow().contains(&(socket, cuid))
    }

    pub fn read_interest_count(&self) -> usize {
        self.read_interests.borrow().len()
    }

    pub fn write_interest_count(&self) -> usize {
        self.write_interests.borrow().len()
    }

    /// Signal every command to stop at the top of its next step.
    pub fn halt(&self) {
        self.halted.set(true);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.get()
    }

    pub fn increase_connections(&self) {
        self.connections.set(self.connections.get() + 1);
    }

    pub fn decrease_connections(&self) {
        let connections = self.connections.get();
        if connections > 0 {
            self.connections.set(connections - 1);
        }
    }

    pub fn active_connections(&self) -> usize {
        self.connections.get()
    }

    /// Push a command onto the ready queue.
    pub fn enqueue(&self, command: Box<Command>) {
        self.ready.borrow_mut().push_back(command);
    }

    pub fn queued_commands(&self) -> usize {
        self.ready.borrow().len()
    }

    /// Run one scheduler pass, stepping every currently ready command once
    /// and requeueing the ones that ask to run again.
    ///
    /// Returns the number of commands stepped.
    pub fn run_once(&self) -> usize {
        let batch: Vec<Box<Command>> = self.ready.borrow_mut().drain(..).collect();
        let stepped = batch.len();

        for mut command in batch {
            match command.step(self) {
                StepResult::Reschedule => self.ready.borrow_mut().push_back(command),
                StepResult::Done => (),
            }
        }

        stepped
    }

    /// Drive scheduler passes until the queue drains or a halt is signaled.
    ///
    /// Integrating with an OS event notification mechanism to sleep until
    /// readiness instead of ticking is left to the embedding application.
    pub fn run(&self) {
        while !self.is_halted() && self.queued_commands() > 0 {
            self.run_once();

            thread::sleep(Duration::from_millis(1));
        }
    }
}
