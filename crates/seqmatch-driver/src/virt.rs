// SPDX-License-Identifier: AGPL-3.0-only

//! Virtual accelerator.
//!
//! A software model of the scan core, faithful enough to run the whole
//! stack above it unchanged: a register file with the core's read/write
//! semantics, a worker thread that plays the core (watches START, walks DMA
//! memory, writes scores, raises DONE and the interrupt), and the matcher
//! the hardware implements. Everything above the register seam - channel,
//! session, sweeps - cannot tell it from silicon, which is what makes it
//! useful in tests and on machines without the board.
//!
//! Register semantics modeled from the synthesized core:
//!
//! | Register | Software view                                   |
//! |----------|-------------------------------------------------|
//! | CONTROL  | DONE clears on read; writes cannot touch DONE   |
//! | ISR      | write toggles (write-1-to-clear via re-toggle)  |
//! | others   | plain storage                                   |

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::channel::{CompletionGate, KernelChannel};
use crate::cma::{VirtArena, VirtCma};
use crate::dma::DmaRegistry;
use crate::error::Result;
use crate::mmio::RegisterBlock;
use seqmatch_hw::addr::PhysAddr;
use seqmatch_hw::layout::{base_code, cell_ptr, seq_ptr, CELL_BYTES, MAX_SEQ_LENGTH};
use seqmatch_hw::regs::{self, control, irq};

/// How often the worker looks for START between jobs.
const IDLE_POLL: Duration = Duration::from_micros(20);

/// Register file with the core's access semantics on the software side.
///
/// Clones share the same words: one clone faces the driver through
/// [`RegisterBlock`], another sits inside the device worker, which uses the
/// raw `peek`/`poke` accessors the way the core's internal state machine
/// would.
#[derive(Debug, Clone, Default)]
pub struct VirtRegisterFile {
    words: Arc<Mutex<[u32; regs::WORD_COUNT]>>,
}

impl VirtRegisterFile {
    /// Fresh register file, all words zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Device-side read, no access semantics.
    pub(crate) fn peek(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= regs::WORD_COUNT * 4, "Register offset out of bounds");
        self.words.lock().unwrap()[offset / 4]
    }

    /// Device-side write, no access semantics.
    pub(crate) fn poke(&self, offset: usize, value: u32) {
        assert!(offset + 4 <= regs::WORD_COUNT * 4, "Register offset out of bounds");
        self.words.lock().unwrap()[offset / 4] = value;
    }
}

impl RegisterBlock for VirtRegisterFile {
    /// # Panics
    ///
    /// Panics if `offset + 4` exceeds the register file.
    fn read32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= regs::WORD_COUNT * 4, "Register offset out of bounds");
        let mut words = self.words.lock().unwrap();
        let value = words[offset / 4];
        if offset == regs::CONTROL {
            // DONE is clear-on-read, the core's completion handshake
            words[offset / 4] = value & !control::DONE;
        }
        value
    }

    /// # Panics
    ///
    /// Panics if `offset + 4` exceeds the register file.
    fn write32(&self, offset: usize, value: u32) {
        assert!(offset + 4 <= regs::WORD_COUNT * 4, "Register offset out of bounds");
        let mut words = self.words.lock().unwrap();
        match offset {
            // Software cannot set or clear DONE by writing
            regs::CONTROL => {
                words[offset / 4] =
                    (value & !control::DONE) | (words[offset / 4] & control::DONE);
            }
            // Toggle-on-write interrupt status
            regs::ISR => words[offset / 4] ^= value,
            _ => words[offset / 4] = value,
        }
    }
}

/// Job registers as the core latches them on START.
#[derive(Debug, Clone, Copy)]
struct JobRegs {
    target_seq: PhysAddr,
    query_seq: PhysAddr,
    target_count: u32,
    query_count: u32,
    target_len: PhysAddr,
    query_len: PhysAddr,
    output: PhysAddr,
}

fn wide(lo: u32, hi: u32) -> PhysAddr {
    PhysAddr::new(u64::from(hi) << 32 | u64::from(lo))
}

impl JobRegs {
    fn latch(file: &VirtRegisterFile) -> Self {
        Self {
            target_seq: wide(file.peek(regs::TARGET_PTR_LO), file.peek(regs::TARGET_PTR_HI)),
            query_seq: wide(file.peek(regs::QUERY_PTR_LO), file.peek(regs::QUERY_PTR_HI)),
            target_count: file.peek(regs::TARGET_COUNT),
            query_count: file.peek(regs::QUERY_COUNT),
            target_len: wide(file.peek(regs::TARGET_LEN_LO), file.peek(regs::TARGET_LEN_HI)),
            query_len: wide(file.peek(regs::QUERY_LEN_LO), file.peek(regs::QUERY_LEN_HI)),
            output: wide(file.peek(regs::OUTPUT_PTR_LO), file.peek(regs::OUTPUT_PTR_HI)),
        }
    }
}

/// The modeled core: a worker thread behind a [`VirtRegisterFile`].
pub struct VirtDevice {
    regs: VirtRegisterFile,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for VirtDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtDevice")
            .field("running", &self.worker.is_some())
            .finish()
    }
}

impl VirtDevice {
    /// Start the core model over `arena`, completing into `gate`.
    ///
    /// `regs` is the shared register file; `gate` must be the gate of the
    /// channel driving those registers, or interrupt-mode waits will never
    /// wake.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the worker thread cannot be spawned.
    pub fn spawn(
        arena: Arc<VirtArena>,
        regs: VirtRegisterFile,
        gate: Arc<CompletionGate>,
    ) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&shutdown);
        let file = regs.clone();

        let worker = std::thread::Builder::new()
            .name("seqmatch-virt".into())
            .spawn(move || worker_loop(&arena, &file, &gate, &stop))?;

        tracing::debug!("Virtual scan core started");

        Ok(Self {
            regs,
            shutdown,
            worker: Some(worker),
        })
    }

    /// The shared register file.
    #[must_use]
    pub fn registers(&self) -> VirtRegisterFile {
        self.regs.clone()
    }
}

impl Drop for VirtDevice {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        tracing::debug!("Virtual scan core stopped");
    }
}

fn worker_loop(
    arena: &VirtArena,
    file: &VirtRegisterFile,
    gate: &CompletionGate,
    shutdown: &AtomicBool,
) {
    while !shutdown.load(Ordering::Relaxed) {
        let ctrl = file.peek(regs::CONTROL);
        if ctrl & control::START == 0 {
            std::thread::sleep(IDLE_POLL);
            continue;
        }

        // Accept: drop START and any stale DONE from an unread completion
        file.poke(regs::CONTROL, ctrl & !(control::START | control::DONE));
        let job = JobRegs::latch(file);

        if !run_job(arena, &job) {
            tracing::warn!(
                "Job touched memory outside the arena (output at {}); completing without scores",
                job.output
            );
        }

        // Completion: DONE always rises, interrupt only when enabled
        let ctrl = file.peek(regs::CONTROL);
        file.poke(regs::CONTROL, ctrl | control::DONE);
        if file.peek(regs::GIER) & irq::ENABLE != 0 && file.peek(regs::IER) & irq::DONE != 0 {
            file.poke(regs::ISR, file.peek(regs::ISR) | irq::DONE);
            KernelChannel::handle_irq(file, gate);
        }
    }
}

/// Run one latched job against the arena. False when a pointer or length
/// register leads outside the arena; the caller still completes the job so
/// a waiter never hangs on a misprogrammed core.
#[allow(clippy::cast_possible_truncation)]
fn run_job(arena: &VirtArena, job: &JobRegs) -> bool {
    let stride = MAX_SEQ_LENGTH as u32;
    let mut target = vec![0u8; MAX_SEQ_LENGTH];
    let mut query = vec![0u8; MAX_SEQ_LENGTH];

    for t in 0..job.target_count {
        let Some(tlen) = arena.read_u32(cell_ptr(job.target_len, t)) else {
            return false;
        };
        let tlen = (tlen as usize).min(MAX_SEQ_LENGTH);
        if !arena.read_into(seq_ptr(job.target_seq, t, stride), &mut target[..tlen]) {
            return false;
        }

        for q in 0..job.query_count {
            let Some(qlen) = arena.read_u32(cell_ptr(job.query_len, q)) else {
                return false;
            };
            let qlen = (qlen as usize).min(MAX_SEQ_LENGTH);
            if !arena.read_into(seq_ptr(job.query_seq, q, stride), &mut query[..qlen]) {
                return false;
            }

            let pos = min_distance_position(&target[..tlen], &query[..qlen]);
            let cell = u64::from(t) * u64::from(job.query_count) + u64::from(q);
            if !arena.write_u32(job.output.offset(cell * CELL_BYTES as u64), pos) {
                return false;
            }
        }
    }
    true
}

/// Position in `target` where `query` matches with the fewest edits.
///
/// Edit distance is Levenshtein over two-bit base codes, matches may start
/// anywhere in the target, and the reported position is where the best
/// match ends. Ties go to the earliest position (strictly-less minimum).
/// Queries up to 64 bases run bit-parallel; longer ones fall back to the
/// row-wise scan.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn min_distance_position(target: &[u8], query: &[u8]) -> u32 {
    if target.is_empty() || query.is_empty() {
        return 0;
    }
    if query.len() > 64 {
        return dp_min_distance_position(target, query);
    }

    let m = query.len();
    let mut peq = [0u64; 4];
    for (i, &q) in query.iter().enumerate() {
        peq[base_code(q) as usize] |= 1 << i;
    }

    let ones = if m == 64 { u64::MAX } else { (1u64 << m) - 1 };
    let high = 1u64 << (m - 1);
    let mut vp = ones;
    let mut vn = 0u64;
    let mut score = m;

    let mut best = usize::MAX;
    let mut best_pos = 0usize;

    for (j, &c) in target.iter().enumerate() {
        let eq = peq[base_code(c) as usize];
        let x = eq | vn;
        let d0 = (((x & vp).wrapping_add(vp)) ^ vp) | x;
        let hn = vp & d0;
        let hp = vn | !(vp | d0);

        if hp & high != 0 {
            score += 1;
        } else if hn & high != 0 {
            score -= 1;
        }

        let shifted = hp << 1;
        vn = shifted & d0;
        vp = (hn << 1) | !(shifted | d0);

        if score < best {
            best = score;
            best_pos = j;
        }
    }

    best_pos as u32
}

/// Row-wise form of the same scan, one column of the DP matrix at a time.
#[allow(clippy::cast_possible_truncation)]
fn dp_min_distance_position(target: &[u8], query: &[u8]) -> u32 {
    let m = query.len();
    let mut col: Vec<usize> = (0..=m).collect();

    let mut best = usize::MAX;
    let mut best_pos = 0usize;

    for (j, &c) in target.iter().enumerate() {
        // col[0] stays 0: a match may start at any target position
        let mut diag = 0;
        for i in 1..=m {
            let saved = col[i];
            let sub = diag + usize::from(base_code(query[i - 1]) != base_code(c));
            col[i] = sub.min(col[i] + 1).min(col[i - 1] + 1);
            diag = saved;
        }
        if col[m] < best {
            best = col[m];
            best_pos = j;
        }
    }

    best_pos as u32
}

/// Registry, device and channel wired over one arena, ready for
/// [`crate::session::AcceleratorSession::open_command_device`].
///
/// # Errors
///
/// Returns the arena allocation error if `capacity` cannot be reserved.
pub fn virtual_setup(
    capacity: usize,
) -> Result<(DmaRegistry, VirtDevice, KernelChannel<VirtRegisterFile>)> {
    let pool = VirtCma::new(capacity)?;
    let arena = pool.arena();
    let registry = DmaRegistry::new(Box::new(pool));

    let file = VirtRegisterFile::new();
    let channel = KernelChannel::new(file.clone());
    let device = VirtDevice::spawn(arena, file, channel.gate())?;

    Ok((registry, device, channel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CommandDevice;
    use seqmatch_hw::message::{CommandMessage, WaitMode};

    #[test]
    fn done_clears_on_read() {
        let file = VirtRegisterFile::new();
        file.poke(regs::CONTROL, control::DONE);
        assert_eq!(file.read32(regs::CONTROL) & control::DONE, control::DONE);
        assert_eq!(file.read32(regs::CONTROL) & control::DONE, 0);
    }

    #[test]
    fn software_writes_cannot_touch_done() {
        let file = VirtRegisterFile::new();
        file.write32(regs::CONTROL, control::DONE);
        assert_eq!(file.peek(regs::CONTROL), 0);

        file.poke(regs::CONTROL, control::DONE);
        file.write32(regs::CONTROL, control::START);
        assert_eq!(file.peek(regs::CONTROL), control::START | control::DONE);
    }

    #[test]
    fn isr_write_toggles() {
        let file = VirtRegisterFile::new();
        file.write32(regs::ISR, 1);
        assert_eq!(file.peek(regs::ISR), 1);
        file.write32(regs::ISR, 1);
        assert_eq!(file.peek(regs::ISR), 0);
    }

    #[test]
    fn exact_match_reports_end_position() {
        // ACGT sits at indices 2..=5
        assert_eq!(min_distance_position(b"AAACGTAA", b"ACGT"), 5);
    }

    #[test]
    fn earliest_minimum_wins() {
        // The query matches exactly in two places; the first ending wins
        assert_eq!(min_distance_position(b"ACGTACGT", b"ACGT"), 3);
    }

    #[test]
    fn empty_inputs_report_position_zero() {
        assert_eq!(min_distance_position(b"", b"ACGT"), 0);
        assert_eq!(min_distance_position(b"ACGT", b""), 0);
    }

    #[test]
    fn case_is_ignored_like_the_comparator() {
        assert_eq!(
            min_distance_position(b"ttACGTtt", b"acgt"),
            min_distance_position(b"TTACGTTT", b"ACGT")
        );
    }

    #[test]
    fn bit_parallel_agrees_with_row_scan() {
        let targets: [&[u8]; 4] = [
            b"ACGTACGTACGTACGT",
            b"TTTTTTTTTTTT",
            b"GATTACAGATTACA",
            b"CCCCGGGGAAAATTTT",
        ];
        let queries: [&[u8]; 5] = [b"ACGT", b"GATTACA", b"TTTT", b"A", b"CGGGGA"];

        for target in targets {
            for query in queries {
                assert_eq!(
                    min_distance_position(target, query),
                    dp_min_distance_position(target, query),
                    "target {:?} query {:?}",
                    std::str::from_utf8(target).unwrap(),
                    std::str::from_utf8(query).unwrap(),
                );
            }
        }
    }

    #[test]
    fn sixty_four_base_query_stays_bit_parallel() {
        let query = [b'A'; 64];
        let mut target = vec![b'C'; 40];
        target.extend_from_slice(&[b'A'; 64]);
        assert_eq!(
            min_distance_position(&target, &query),
            dp_min_distance_position(&target, &query)
        );
    }

    fn write_record(buf: &mut crate::dma::DmaBuffer, index: usize, bases: &[u8]) {
        let start = index * MAX_SEQ_LENGTH;
        buf.as_mut_slice()[start..start + bases.len()].copy_from_slice(bases);
    }

    #[test]
    fn programmed_job_scores_every_pair() {
        let (registry, _device, mut channel) = virtual_setup(1 << 20).unwrap();

        let mut tseq = registry.allocate(2 * MAX_SEQ_LENGTH, false).unwrap();
        let mut tlen = registry.allocate(2 * CELL_BYTES, false).unwrap();
        let mut qseq = registry.allocate(MAX_SEQ_LENGTH, false).unwrap();
        let mut qlen = registry.allocate(CELL_BYTES, false).unwrap();
        let mut out = registry.allocate(2 * CELL_BYTES, false).unwrap();

        write_record(&mut tseq, 0, b"AAACGTAA");
        write_record(&mut tseq, 1, b"ACGTTTTT");
        tlen.as_u32_slice_mut().copy_from_slice(&[8, 8]);
        write_record(&mut qseq, 0, b"ACGT");
        qlen.as_u32_slice_mut()[0] = 4;
        out.as_u32_slice_mut().fill(seqmatch_hw::layout::SCORE_SENTINEL);

        let msg = CommandMessage {
            target_seq: tseq.phys(),
            query_seq: qseq.phys(),
            target_count: 2,
            query_count: 1,
            target_len: tlen.phys(),
            query_len: qlen.phys(),
            output: out.phys(),
            wait_mode: WaitMode::Polling,
        };

        channel.configure(&msg.encode()).unwrap();
        channel.trigger().unwrap();

        assert_eq!(out.as_u32_slice(), &[5, 3]);
    }

    #[test]
    fn misprogrammed_job_still_completes() {
        let (_registry, _device, mut channel) = virtual_setup(1 << 16).unwrap();

        let msg = CommandMessage {
            target_seq: PhysAddr::new(0x1000),
            query_seq: PhysAddr::new(0x2000),
            target_count: 1,
            query_count: 1,
            target_len: PhysAddr::new(0x3000),
            query_len: PhysAddr::new(0x4000),
            output: PhysAddr::new(0x5000),
            wait_mode: WaitMode::Polling,
        };

        channel.configure(&msg.encode()).unwrap();
        // Pointers fall outside the arena; completion must still arrive
        channel.trigger().unwrap();
    }
}
