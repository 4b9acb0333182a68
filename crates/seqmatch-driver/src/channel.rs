//! In-process command channel with kernel-module semantics.
//!
//! [`KernelChannel`] drives a [`RegisterBlock`] through the same two-call
//! protocol the character device exposes: `configure` validates and programs
//! the job registers, `trigger` enables interrupts, sets START and waits for
//! completion according to the configured wait mode. The virtual accelerator
//! runs behind this channel; on hardware the same sequence lives in the
//! kernel module and [`crate::device::CharDevice`] forwards to it.
//!
//! Completion is a single-slot notification: [`CompletionGate`] remembers a
//! signal that arrives before the waiter blocks, so the interrupt winning
//! the race against the sleeping thread is not lost.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::device::CommandDevice;
use crate::error::{DriverError, Result};
use crate::mmio::RegisterBlock;
use seqmatch_hw::message::{CommandMessage, WaitMode, WIRE_LEN};
use seqmatch_hw::regs::{self, control, irq};

/// Upper bound on DONE polls before a polling wait gives up.
pub const MAX_POLL_ITERATIONS: u32 = 500_000;

/// Pause between DONE polls.
const POLL_PACING: Duration = Duration::from_micros(1);

/// Default per-job wait bound for interrupt-mode completion.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Single-slot completion notification.
///
/// `signal` stores the event; `wait_timeout` consumes it. A signal delivered
/// before the waiter arrives satisfies the next wait instead of vanishing,
/// which is the property the interrupt handler relies on.
#[derive(Debug, Default)]
pub struct CompletionGate {
    /// Pending-completion flag
    flag: Mutex<bool>,
    /// Wakes the waiter when the flag flips
    cond: Condvar,
}

impl CompletionGate {
    /// Create a gate with no pending completion.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard any stale completion before starting a new job.
    pub fn arm(&self) {
        *self.flag.lock().unwrap() = false;
    }

    /// Record a completion and wake the waiter.
    ///
    /// Called from the interrupt path: takes the flag mutex briefly, never
    /// allocates.
    pub fn signal(&self) {
        *self.flag.lock().unwrap() = true;
        self.cond.notify_one();
    }

    /// Block until a completion arrives or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Timeout`] when no signal arrives in time.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut done = self.flag.lock().unwrap();
        while !*done {
            let now = Instant::now();
            if now >= deadline {
                return Err(DriverError::Timeout {
                    duration_ms: timeout.as_millis().try_into().unwrap_or(u64::MAX),
                });
            }
            let (guard, _) = self.cond.wait_timeout(done, deadline - now).unwrap();
            done = guard;
        }
        *done = false;
        Ok(())
    }
}

/// Command channel over a register block.
#[derive(Debug)]
pub struct KernelChannel<R: RegisterBlock> {
    regs: R,
    gate: Arc<CompletionGate>,
    wait_mode: WaitMode,
    wait_timeout: Duration,
}

impl<R: RegisterBlock> KernelChannel<R> {
    /// Wrap a register block in the command protocol.
    pub fn new(regs: R) -> Self {
        Self {
            regs,
            gate: Arc::new(CompletionGate::new()),
            wait_mode: WaitMode::default(),
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }

    /// Gate the interrupt handler signals on completion.
    #[must_use]
    pub fn gate(&self) -> Arc<CompletionGate> {
        Arc::clone(&self.gate)
    }

    /// The wait mode carried by the last accepted configure call.
    #[must_use]
    pub const fn wait_mode(&self) -> WaitMode {
        self.wait_mode
    }

    /// Bound interrupt-mode waits to `timeout` per job.
    pub fn set_wait_timeout(&mut self, timeout: Duration) {
        self.wait_timeout = timeout;
    }

    /// Interrupt handler body: acknowledge the core and record completion.
    ///
    /// Runs in interrupt context on the virtual device's worker thread, so
    /// it only does the two things a handler may do here: toggle-write the
    /// ISR bit back to clear it, and flip the gate.
    pub fn handle_irq(regs: &R, gate: &CompletionGate) {
        regs.write32(regs::ISR, irq::DONE);
        gate.signal();
    }
}

impl<R: RegisterBlock + Send> CommandDevice for KernelChannel<R> {
    /// Validate and program a job.
    ///
    /// A payload shorter than the fixed message length is rejected before
    /// any register is written, so a bad configure leaves the core exactly
    /// as it was.
    fn configure(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() < WIRE_LEN {
            return Err(DriverError::MessageTooShort {
                len: payload.len(),
                need: WIRE_LEN,
            });
        }

        let msg = CommandMessage::decode(payload)?;
        for (offset, value) in msg.register_values() {
            self.regs.write32(offset, value);
        }
        self.wait_mode = msg.wait_mode;

        tracing::trace!(
            "Programmed job: {}x{} pairs, wait mode {:?}",
            msg.target_count,
            msg.query_count,
            msg.wait_mode
        );
        Ok(())
    }

    /// Start the programmed job and wait according to the wait mode.
    ///
    /// Interrupt enables are dropped again on every exit path, including
    /// timeout and fire-and-forget, so a later job starts from a known
    /// interrupt state.
    fn trigger(&mut self) -> Result<()> {
        self.regs.write32(regs::GIER, irq::ENABLE);
        self.regs.write32(regs::IER, irq::DONE);
        self.gate.arm();

        let ctrl = self.regs.read32(regs::CONTROL);
        self.regs.write32(regs::CONTROL, ctrl | control::START);

        let outcome = match self.wait_mode {
            WaitMode::Interrupt => self.gate.wait_timeout(self.wait_timeout),
            WaitMode::Polling => poll_done(&self.regs),
            WaitMode::FireAndForget => Ok(()),
        };

        self.regs.write32(regs::GIER, 0);
        self.regs.write32(regs::IER, 0);

        outcome
    }
}

/// Poll CONTROL until DONE sets, up to [`MAX_POLL_ITERATIONS`].
///
/// # Errors
///
/// Returns [`DriverError::Timeout`] when the poll budget runs out.
pub(crate) fn poll_done(regs: &impl RegisterBlock) -> Result<()> {
    poll_done_with(regs, MAX_POLL_ITERATIONS)
}

fn poll_done_with(regs: &impl RegisterBlock, max_polls: u32) -> Result<()> {
    let start = Instant::now();
    for _ in 0..max_polls {
        if regs.read32(regs::CONTROL) & control::DONE != 0 {
            return Ok(());
        }
        std::thread::sleep(POLL_PACING);
    }
    Err(DriverError::Timeout {
        duration_ms: start.elapsed().as_millis().try_into().unwrap_or(u64::MAX),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqmatch_hw::addr::PhysAddr;

    /// Plain shared word file, no hardware semantics.
    #[derive(Clone, Default)]
    struct SharedRegs {
        words: Arc<Mutex<[u32; regs::WORD_COUNT]>>,
    }

    impl RegisterBlock for SharedRegs {
        fn read32(&self, offset: usize) -> u32 {
            self.words.lock().unwrap()[offset / 4]
        }

        fn write32(&self, offset: usize, value: u32) {
            self.words.lock().unwrap()[offset / 4] = value;
        }
    }

    fn sample_message(mode: WaitMode) -> CommandMessage {
        CommandMessage {
            target_seq: PhysAddr::new(0x7000_0000),
            query_seq: PhysAddr::new(0x7100_0000),
            target_count: 2,
            query_count: 3,
            target_len: PhysAddr::new(0x7200_0000),
            query_len: PhysAddr::new(0x7300_0000),
            output: PhysAddr::new(0x1_7400_0000),
            wait_mode: mode,
        }
    }

    #[test]
    fn signal_before_wait_is_not_lost() {
        let gate = CompletionGate::new();
        gate.arm();
        gate.signal();
        assert!(gate.wait_timeout(Duration::from_millis(5)).is_ok());
    }

    #[test]
    fn arm_discards_stale_completion() {
        let gate = CompletionGate::new();
        gate.signal();
        gate.arm();
        let err = gate.wait_timeout(Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, DriverError::Timeout { .. }));
    }

    #[test]
    fn wait_consumes_the_signal() {
        let gate = CompletionGate::new();
        gate.signal();
        assert!(gate.wait_timeout(Duration::from_millis(5)).is_ok());
        assert!(gate.wait_timeout(Duration::from_millis(5)).is_err());
    }

    #[test]
    fn short_configure_leaves_registers_untouched() {
        let regs = SharedRegs::default();
        let mut channel = KernelChannel::new(regs.clone());
        let err = channel.configure(&[0u8; WIRE_LEN - 1]).unwrap_err();
        assert!(matches!(
            err,
            DriverError::MessageTooShort { len: 55, need: WIRE_LEN }
        ));
        assert!(regs.words.lock().unwrap().iter().all(|&w| w == 0));
    }

    #[test]
    fn configure_programs_exactly_the_job_registers() {
        let regs = SharedRegs::default();
        let mut channel = KernelChannel::new(regs.clone());
        let msg = sample_message(WaitMode::Polling);
        channel.configure(&msg.encode()).unwrap();

        for (offset, value) in msg.register_values() {
            assert_eq!(regs.read32(offset), value, "offset {offset:#x}");
        }
        assert_eq!(regs.read32(regs::CONTROL), 0);
        assert_eq!(regs.read32(regs::GIER), 0);
        assert_eq!(channel.wait_mode(), WaitMode::Polling);
    }

    #[test]
    fn polling_sees_done_set_by_another_thread() {
        let regs = SharedRegs::default();
        let mut channel = KernelChannel::new(regs.clone());
        channel.configure(&sample_message(WaitMode::Polling).encode()).unwrap();

        let device_side = regs.clone();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            device_side.write32(regs::CONTROL, control::DONE);
        });

        channel.trigger().unwrap();
        worker.join().unwrap();
        assert_eq!(regs.read32(regs::GIER), 0);
        assert_eq!(regs.read32(regs::IER), 0);
    }

    #[test]
    fn interrupt_wait_completes_via_handler() {
        let regs = SharedRegs::default();
        let mut channel = KernelChannel::new(regs.clone());
        channel.configure(&sample_message(WaitMode::Interrupt).encode()).unwrap();

        let gate = channel.gate();
        let device_side = regs.clone();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            device_side.write32(regs::CONTROL, control::DONE);
            device_side.write32(regs::ISR, irq::DONE);
            KernelChannel::handle_irq(&device_side, &gate);
        });

        channel.trigger().unwrap();
        worker.join().unwrap();
        // Plain register file records the acknowledge write verbatim
        assert_eq!(regs.read32(regs::ISR), irq::DONE);
        assert_eq!(regs.read32(regs::GIER), 0);
        assert_eq!(regs.read32(regs::IER), 0);
    }

    #[test]
    fn interrupt_timeout_still_drops_enables() {
        let regs = SharedRegs::default();
        let mut channel = KernelChannel::new(regs.clone());
        channel.set_wait_timeout(Duration::from_millis(5));
        channel.configure(&sample_message(WaitMode::Interrupt).encode()).unwrap();

        let err = channel.trigger().unwrap_err();
        assert!(matches!(err, DriverError::Timeout { .. }));
        assert_eq!(regs.read32(regs::GIER), 0);
        assert_eq!(regs.read32(regs::IER), 0);
        // START stays set: the job was issued, only the wait gave up
        assert_eq!(regs.read32(regs::CONTROL) & control::START, control::START);
    }

    #[test]
    fn fire_and_forget_returns_without_waiting() {
        let regs = SharedRegs::default();
        let mut channel = KernelChannel::new(regs.clone());
        channel.configure(&sample_message(WaitMode::FireAndForget).encode()).unwrap();

        let began = Instant::now();
        channel.trigger().unwrap();
        assert!(began.elapsed() < Duration::from_millis(100));
        assert_eq!(regs.read32(regs::CONTROL) & control::START, control::START);
        assert_eq!(regs.read32(regs::GIER), 0);
    }

    #[test]
    fn poll_budget_exhaustion_is_a_timeout() {
        let regs = SharedRegs::default();
        let err = poll_done_with(&regs, 10).unwrap_err();
        assert!(matches!(err, DriverError::Timeout { .. }));
    }
}
