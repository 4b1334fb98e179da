//! a2core - Apple II emulation core
//!
//! コマンドラインからマシンを構成して実行する。
//! 画面は持たないので、`--cycles`でテキスト画面を出力するか、
//! 標準入力からキー入力とコマンドを送って動かす。
//!
//! # 使用方法
//! ```text
//! a2core -m 2plus dos33.woz --cycles 100000000
//! a2core -m 2enh -s 6=diskii,disk1=prodos.po,fast=false
//! ```

use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use a2core::apple2::Apple2;
use a2core::config::MachineConfig;
use a2core::disk_log::{self, DiskLogLevel};
use a2core::error::{EmuError, Result};
use a2core::runner::{Command, CommandSender, Runner};
use clap::Parser;

/// a2core - Apple II emulation core
#[derive(Parser, Debug)]
#[command(name = "a2core")]
#[command(version)]
#[command(about = "a2core - Apple II emulation core", long_about = None)]
struct Args {
    /// ディスクイメージ（ドライブ1に入れる）
    disk: Option<PathBuf>,

    /// ドライブ2のディスクイメージ
    #[arg(long)]
    disk2: Option<PathBuf>,

    /// 機種 (2, 2plus, 2e, 2enh)
    #[arg(short, long)]
    model: Option<String>,

    /// マシン構成ファイル（JSON）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 相対パスの基準ディレクトリ
    #[arg(long)]
    home: Option<String>,

    /// メインROM
    #[arg(long)]
    rom: Option<String>,

    /// キャラクタROM
    #[arg(long)]
    charrom: Option<String>,

    /// スロットのカード（例: 6=diskii,disk1=dos33.woz）
    #[arg(short, long = "slot", value_name = "N=SPEC")]
    slots: Vec<String>,

    /// 任意のキーを上書き（例: ramworks=1024）
    #[arg(short = 'o', long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,

    /// 速度: ntsc, pal, full, またはMHz
    #[arg(long)]
    speed: Option<String>,

    /// 英小文字を大文字で入力する
    #[arg(long)]
    force_caps: bool,

    /// トレース: cpu, disk, io（カンマ区切り）
    #[arg(long)]
    trace: Option<String>,

    /// ディスクログ: motor, head, data, all（+で複数指定）
    #[arg(long, default_value = "")]
    disk_log: String,

    /// 指定サイクル実行してテキスト画面を出力し終了（画面なし）
    #[arg(long)]
    cycles: Option<u64>,

    /// 起動後に入力する文字列
    #[arg(long)]
    text: Option<String>,
}

/// 引数からマシン構成を作る
fn build_config(args: &Args) -> Result<MachineConfig> {
    let mut config = match &args.config {
        Some(path) => MachineConfig::load_from(path)?,
        None => MachineConfig::default(),
    };
    if let Some(model) = &args.model {
        config.set("model", model)?;
    }
    if let Some(home) = &args.home {
        config.set("home", home)?;
    }
    if let Some(rom) = &args.rom {
        config.set("rom", rom)?;
    }
    if let Some(charrom) = &args.charrom {
        config.set("charrom", charrom)?;
    }
    if let Some(speed) = &args.speed {
        config.set("speed", speed)?;
    }
    if let Some(trace) = &args.trace {
        config.set("trace", trace)?;
    }
    if args.force_caps {
        config.set("forceCaps", "true")?;
    }
    for slot in &args.slots {
        let (n, spec) = slot.split_once('=').ok_or_else(|| {
            EmuError::ConfigInvalid(format!("--slot expects N=SPEC, got '{}'", slot))
        })?;
        config.set(&format!("s{}", n.trim()), spec)?;
    }
    for assignment in &args.overrides {
        config.apply(assignment)?;
    }
    config.validate()?;
    Ok(config)
}

fn setup(args: &Args) -> Result<(Apple2, f64)> {
    let level = DiskLogLevel::parse(&args.disk_log).ok_or_else(|| {
        EmuError::ConfigInvalid(format!("unknown disk log level '{}'", args.disk_log))
    })?;
    disk_log::set_log_level(level);

    let config = build_config(args)?;
    let mut machine = config.build_machine()?;
    if let Some(disk) = &args.disk {
        machine.load_disk(0, disk)?;
    }
    if let Some(disk) = &args.disk2 {
        machine.load_disk(1, disk)?;
    }
    if let Some(text) = &args.text {
        machine.type_text(text);
    }
    Ok((machine, config.speed_mhz()?))
}

/// 画面なしで指定サイクル実行してテキスト画面を出力
fn run_headless(machine: &mut Apple2, cycles: u64) -> Result<()> {
    let start = Instant::now();
    machine.run_cycles(cycles);
    if let Some(err) = machine.take_fatal() {
        return Err(err);
    }
    let elapsed = start.elapsed();
    let mhz = (cycles as f64) / elapsed.as_secs_f64() / 1_000_000.0;
    log::info!("executed {} cycles in {:?} ({:.2} MHz effective)", cycles, elapsed, mhz);
    println!("{}", machine.text_snapshot());
    Ok(())
}

/// 標準入力の1行をコマンドにする。`:`で始まらない行はキー入力
fn parse_line(line: &str) -> Option<Command> {
    let Some(rest) = line.strip_prefix(':') else {
        return Some(Command::TypeText(format!("{}\r", line)));
    };
    let mut words = rest.split_whitespace();
    let command = match words.next()? {
        "quit" | "q" => Command::Kill,
        "pause" => Command::PauseUnpause,
        "reset" => Command::Reset,
        "speed" => Command::ToggleSpeed,
        "mhz" => Command::ShowSpeed,
        "debug" => Command::DumpDebugInfo,
        "chargen" => Command::NextCharGen,
        "trace" => Command::ToggleCPUTrace,
        "load" => {
            let drive: usize = words.next()?.parse().ok()?;
            let path: Vec<&str> = words.collect();
            Command::LoadDisk(drive.checked_sub(1)?, PathBuf::from(path.join(" ")))
        }
        _ => return None,
    };
    Some(command)
}

/// 標準入力を読んでコマンドを送るスレッド。EOFでKill
fn spawn_input(sender: CommandSender) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            match parse_line(line.trim_end()) {
                Some(command) => {
                    if sender.send(command).is_err() {
                        return;
                    }
                }
                None => eprintln!("unknown command: {}", line),
            }
        }
        let _ = sender.send(Command::Kill);
    });
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let (mut machine, speed) = match setup(&args) {
        Ok(setup) => setup,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(1);
        }
    };

    let result = match args.cycles {
        Some(cycles) => run_headless(&mut machine, cycles),
        None => {
            let (mut runner, sender) = Runner::new(machine, speed);
            spawn_input(sender);
            runner.run()
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        assert_eq!(parse_line("RUN"), Some(Command::TypeText("RUN\r".to_string())));
        assert_eq!(parse_line(":quit"), Some(Command::Kill));
        assert_eq!(
            parse_line(":load 2 /tmp/my disk.woz"),
            Some(Command::LoadDisk(1, PathBuf::from("/tmp/my disk.woz")))
        );
        assert_eq!(parse_line(":load 0 a.woz"), None);
        assert_eq!(parse_line(":fly"), None);
    }

    #[test]
    fn test_build_config_from_args() {
        let args = Args::parse_from([
            "a2core", "-m", "2plus", "-s", "6=", "-s", "4=saturn", "--speed", "full", "-o",
            "s0=empty",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.model, "2plus");
        assert_eq!(config.slots[4], "saturn");
        assert_eq!(config.slots[6], "");
        assert_eq!(config.slots[0], "empty");
        assert_eq!(config.speed_mhz().unwrap(), 0.0);

        let bad = Args::parse_from(["a2core", "-s", "9=diskii"]);
        assert!(matches!(build_config(&bad), Err(EmuError::ConfigInvalid(_))));
    }
}
