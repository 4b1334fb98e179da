//! 実行ループ
//!
//! エミュレータスレッドで命令をまとめて実行し、その合間にコマンドを処理して
//! 実時間に合わせてスリープする。

use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::apple2::Apple2;
use crate::error::Result;

/// 1回のバーストで実行するステップ数
const SPIN_COUNT: usize = 100;
/// コマンドキューの容量
const COMMAND_QUEUE_SIZE: usize = 128;
/// 一時停止中のスリープ
const PAUSE_SLEEP: Duration = Duration::from_millis(200);
/// これより大きくずれたらペース基準をリセットする
const MAX_DRIFT: Duration = Duration::from_millis(100);
/// 速度計測の間隔（サイクル）
const SPEED_WINDOW: u64 = 1_000_000;

/// ホストから実行ループへのコマンド
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Kill,
    Pause,
    Start,
    PauseUnpause,
    /// 設定速度と最高速を切り替える
    ToggleSpeed,
    ShowSpeed,
    Reset,
    DumpDebugInfo,
    NextCharGen,
    ToggleCPUTrace,
    LoadDisk(usize, PathBuf),
    TypeText(String),
}

pub type CommandSender = SyncSender<Command>;

/// 実行ループ
pub struct Runner {
    machine: Apple2,
    commands: Receiver<Command>,
    paused: bool,
    /// 0なら停止しない
    cycle_breakpoint: u64,
    /// 設定速度（MHz、0なら最高速）
    speed_mhz: f64,
    /// ペース調整が有効か（ToggleSpeedで切り替え）
    paced: bool,
    fast_requests: Arc<AtomicI32>,
    // ペース調整の基準
    ref_wall: Instant,
    ref_cycles: u64,
    // 速度計測の基準
    speed_wall: Instant,
    speed_cycles: u64,
    current_mhz: f64,
}

impl Runner {
    /// `speed_mhz`が0以下なら最高速で動かす
    pub fn new(machine: Apple2, speed_mhz: f64) -> (Self, CommandSender) {
        let (sender, commands) = mpsc::sync_channel(COMMAND_QUEUE_SIZE);
        let fast_requests = machine.fast_mode_counter();
        let now = Instant::now();
        let cycles = machine.cycles();
        let speed_mhz = speed_mhz.max(0.0);
        let runner = Runner {
            machine,
            commands,
            paused: false,
            cycle_breakpoint: 0,
            speed_mhz,
            paced: speed_mhz > 0.0,
            fast_requests,
            ref_wall: now,
            ref_cycles: cycles,
            speed_wall: now,
            speed_cycles: cycles,
            current_mhz: 0.0,
        };
        (runner, sender)
    }

    pub fn machine(&self) -> &Apple2 {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut Apple2 {
        &mut self.machine
    }

    pub fn into_machine(self) -> Apple2 {
        self.machine
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// 指定サイクルに達したら一時停止する（0で解除）
    pub fn set_cycle_breakpoint(&mut self, cycle: u64) {
        self.cycle_breakpoint = cycle;
    }

    /// 直近に計測した実効速度（MHz）
    pub fn current_mhz(&self) -> f64 {
        self.current_mhz
    }

    /// 1サイクルあたりのナノ秒（0ならペース調整しない）
    fn cycle_duration_ns(&self) -> f64 {
        if self.paced && self.speed_mhz > 0.0 {
            1000.0 / self.speed_mhz
        } else {
            0.0
        }
    }

    /// Killか全送信側の破棄まで実行する。バス競合はエラーで返す
    pub fn run(&mut self) -> Result<()> {
        self.reset_pacing();
        log::info!("emulation started ({})", self.speed_label());
        loop {
            if !self.iterate()? {
                log::info!("emulation stopped at cycle {}", self.machine.cycles());
                return Ok(());
            }
        }
    }

    /// ループ1周分。続けるならtrue
    pub fn iterate(&mut self) -> Result<bool> {
        if self.paused {
            std::thread::sleep(PAUSE_SLEEP);
        } else {
            for _ in 0..SPIN_COUNT {
                self.machine.step();
            }
            if let Some(err) = self.machine.take_fatal() {
                log::error!("fatal: {}", err);
                return Err(err);
            }
            if self.cycle_breakpoint != 0 && self.machine.cycles() >= self.cycle_breakpoint {
                log::info!("breakpoint at cycle {}", self.machine.cycles());
                self.cycle_breakpoint = 0;
                self.set_paused(true);
            }
        }

        if !self.drain_commands() {
            return Ok(false);
        }
        self.pace();
        self.measure_speed();
        Ok(true)
    }

    /// キューにあるコマンドをすべて処理する。Killか切断ならfalse
    fn drain_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(Command::Kill) => return false,
                Ok(command) => self.handle(command),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Kill => {}
            Command::Pause => self.set_paused(true),
            Command::Start => self.set_paused(false),
            Command::PauseUnpause => self.set_paused(!self.paused),
            Command::ToggleSpeed => {
                self.paced = !self.paced;
                self.reset_pacing();
                log::info!("speed: {}", self.speed_label());
            }
            Command::ShowSpeed => {
                log::info!("{} (measured {:.3} MHz)", self.speed_label(), self.current_mhz);
            }
            Command::Reset => {
                self.machine.reset();
                self.reset_pacing();
            }
            Command::DumpDebugInfo => {
                log::info!("{}", self.machine.debug_info());
                log::info!("screen:\n{}", self.machine.text_snapshot());
            }
            Command::NextCharGen => self.machine.next_char_gen(),
            Command::ToggleCPUTrace => {
                self.machine.cpu.trace = !self.machine.cpu.trace;
                log::info!("CPU trace {}", if self.machine.cpu.trace { "on" } else { "off" });
            }
            Command::LoadDisk(drive, path) => match self.machine.load_disk(drive, &path) {
                Ok(()) => log::info!("drive {}: {}", drive + 1, path.display()),
                Err(e) => log::warn!("drive {}: {}", drive + 1, e),
            },
            Command::TypeText(text) => self.machine.type_text(&text),
        }
    }

    fn set_paused(&mut self, paused: bool) {
        if self.paused != paused {
            self.paused = paused;
            log::info!("{}", if paused { "paused" } else { "running" });
        }
        if !paused {
            self.reset_pacing();
        }
    }

    fn reset_pacing(&mut self) {
        self.ref_wall = Instant::now();
        self.ref_cycles = self.machine.cycles();
    }

    /// 実時間とエミュレートしたサイクルを合わせる
    fn pace(&mut self) {
        let ns_per_cycle = self.cycle_duration_ns();
        if self.paused || ns_per_cycle == 0.0 || self.fast_requests.load(Ordering::SeqCst) > 0 {
            self.reset_pacing();
            return;
        }

        let emulated = self.machine.cycles().saturating_sub(self.ref_cycles);
        let target = self.ref_wall + Duration::from_nanos((emulated as f64 * ns_per_cycle) as u64);
        let now = Instant::now();
        if target > now {
            let delta = target - now;
            if delta > MAX_DRIFT {
                self.reset_pacing();
            } else {
                std::thread::sleep(delta);
            }
        } else if now - target > MAX_DRIFT {
            // 遅れすぎたら追いつこうとしない
            self.reset_pacing();
        }
    }

    fn measure_speed(&mut self) {
        let cycles = self.machine.cycles();
        if cycles.saturating_sub(self.speed_cycles) <= SPEED_WINDOW {
            return;
        }
        let elapsed = self.speed_wall.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.current_mhz = (cycles - self.speed_cycles) as f64 / elapsed / 1_000_000.0;
            log::debug!("{:.3} MHz", self.current_mhz);
        }
        self.speed_wall = Instant::now();
        self.speed_cycles = cycles;
    }

    fn speed_label(&self) -> String {
        if self.cycle_duration_ns() == 0.0 {
            "full speed".to_string()
        } else {
            format!("{:.4} MHz", self.speed_mhz)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apple2::tests::test_machine;
    use crate::apple2::AppleModel;
    use crate::cpu::MemoryBus;
    use crate::error::EmuError;

    fn runner() -> (Runner, CommandSender) {
        Runner::new(test_machine(AppleModel::AppleIIPlus), 0.0)
    }

    #[test]
    fn test_kill_stops_run() {
        let (mut r, tx) = runner();
        tx.send(Command::Kill).unwrap();
        let before = r.machine().cycles();
        r.run().unwrap();
        assert!(r.machine().cycles() > before);
    }

    #[test]
    fn test_dropped_sender_stops_run() {
        let (mut r, tx) = runner();
        drop(tx);
        assert!(r.run().is_ok());
    }

    #[test]
    fn test_commands_between_bursts() {
        let (mut r, tx) = runner();
        tx.send(Command::TypeText("RUN".to_string())).unwrap();
        tx.send(Command::ToggleCPUTrace).unwrap();
        tx.send(Command::Pause).unwrap();
        assert!(r.iterate().unwrap());
        assert!(r.is_paused());
        assert!(r.machine().cpu.trace);
        assert_eq!(r.machine_mut().read(0xC000), b'R' | 0x80);

        tx.send(Command::PauseUnpause).unwrap();
        tx.send(Command::ToggleCPUTrace).unwrap();
        assert!(r.iterate().unwrap());
        assert!(!r.is_paused());
        assert!(!r.machine().cpu.trace);
    }

    #[test]
    fn test_breakpoint_pauses() {
        let (mut r, _tx) = runner();
        let target = r.machine().cycles() + 150;
        r.set_cycle_breakpoint(target);
        assert!(r.iterate().unwrap());
        assert!(r.is_paused());
        assert!(r.machine().cycles() >= target);

        let cycles = r.machine().cycles();
        r.handle(Command::Start);
        assert!(!r.is_paused());
        r.iterate().unwrap();
        assert!(r.machine().cycles() > cycles);
    }

    #[test]
    fn test_reset_command() {
        let (mut r, tx) = runner();
        r.machine_mut().cpu.regs.pc = 0x1234;
        tx.send(Command::Pause).unwrap();
        tx.send(Command::Reset).unwrap();
        r.iterate().unwrap();
        assert_eq!(r.machine().cpu.regs.pc, 0xF000);
    }

    #[test]
    fn test_load_disk_without_controller_keeps_running() {
        let (mut r, tx) = runner();
        tx.send(Command::LoadDisk(0, PathBuf::from("missing.woz"))).unwrap();
        assert!(r.iterate().unwrap());
    }

    #[test]
    fn test_bus_conflict_ends_run() {
        let (mut r, _tx) = runner();
        r.machine_mut().activate_dma(2).unwrap();
        assert!(r.machine_mut().activate_dma(3).is_err());
        let err = r.run().unwrap_err();
        assert!(matches!(err, EmuError::BusConflict { holder: 2, requester: 3 }));
    }

    #[test]
    fn test_toggle_speed() {
        let (mut r, tx) = Runner::new(test_machine(AppleModel::AppleIIPlus), 1.0227);
        assert!(r.cycle_duration_ns() > 977.0 && r.cycle_duration_ns() < 978.0);
        tx.send(Command::ToggleSpeed).unwrap();
        r.drain_commands();
        assert_eq!(r.cycle_duration_ns(), 0.0);
        r.handle(Command::ToggleSpeed);
        assert!(r.cycle_duration_ns() > 0.0);
    }

    #[test]
    fn test_fast_mode_skips_pacing() {
        let (mut r, _tx) = Runner::new(test_machine(AppleModel::AppleIIPlus), 0.01);
        // 1バースト300サイクル = 30ms相当
        r.machine().request_fast_mode();
        let start = Instant::now();
        for _ in 0..10 {
            r.iterate().unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(250));
    }
}
