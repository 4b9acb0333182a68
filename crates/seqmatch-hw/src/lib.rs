//! Hardware model for the seqmatch sequence-alignment FPGA accelerator.
//!
//! This crate has **no dependencies** and **no hardware access** — it is a
//! pure model of the PL overlay as seen from the PS: AXI-Lite register
//! offsets, the command message that crosses the user/kernel boundary, the
//! in-memory sequence layout the scan core expects, and the arithmetic that
//! partitions a query sweep into chunk invocations.
//!
//! Everything here must stay computable without a device so that planning
//! and codec behaviour can be tested on any host.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`addr`] | Physical/bus address newtype with lo/hi register splitting |
//! | [`regs`] | AXI-Lite register map — offsets and bit definitions |
//! | [`message`] | Cross-boundary command message wire format |
//! | [`layout`] | Sequence strides, core limits, score sentinel |
//! | [`plan`] | Memory-budget chunk partitioning and calibration arithmetic |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod addr;
pub mod layout;
pub mod message;
pub mod plan;
pub mod regs;
