//! a2core - Apple II emulation core
//!
//! A cycle-counted Apple II core supporting:
//! - Apple II, II+, IIe, IIe Enhanced (6502 / 65C02)
//! - Bank-switching MMU with language card, Saturn 128K, multi-ROM and RAMWorks
//! - Disk II driven by the P6 sequencer, WOZ/DSK/PO/NIB images
//! - A paced execution loop controlled through a command queue

pub mod error;
pub mod cpu;
pub mod memory;
pub mod io;
pub mod card;
pub mod language_card;
pub mod multirom;
pub mod disk;
pub mod disk_log;
pub mod woz;
pub mod apple2;
pub mod runner;
pub mod config;
