//! Mock guest binary for integration testing
//!
//! Accepts the emulator command line the harness builds (`-kernel`,
//! `-initrd`, `-append` plus anything else, which is ignored) and plays a
//! tiny Linux guest on stdin/stdout, the way `-serial stdio` would.
//! Without an initrd the guest panics during boot and hangs.

use std::io::{self, BufReader, Read, Write};
use std::time::Duration;

const PROMPT: &str = "# ";

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let kernel = flag_value(&args, "-kernel");
    let initrd = flag_value(&args, "-initrd");
    let command_line = flag_value(&args, "-append").unwrap_or_default();

    let stdout = io::stdout();
    let mut out = stdout.lock();

    let image = kernel
        .as_deref()
        .and_then(|k| k.rsplit('/').next())
        .unwrap_or("vmlinux");
    emit(&mut out, &format!("Linux version 4.5.0-2-4kc-malta ({}) #1 Debian 4.5.5-1", image));
    emit(&mut out, "CPU0 revision is: 00019300 (MIPS 24Kc)");
    emit(&mut out, &format!("Kernel command line: {}", command_line));

    if initrd.is_none() {
        emit(&mut out, "VFS: Cannot open root device \"(null)\"");
        emit(&mut out, "Kernel panic - not syncing: VFS: Unable to mount root fs");
        hang();
    }

    emit(&mut out, "Freeing unused kernel memory: 1024K");
    emit(&mut out, "Boot successful.");
    prompt(&mut out);

    let mut input = BufReader::new(io::stdin().lock());
    while let Some(line) = read_line(&mut input) {
        let line = line.trim();
        emit(&mut out, line);
        if line.is_empty() {
            prompt(&mut out);
            continue;
        }

        match line {
            "cat /proc/cpuinfo" => {
                emit(&mut out, "system type\t\t: MIPS Malta");
                emit(&mut out, "cpu model\t\t: MIPS 24Kc V0.0  FPU V0.0");
                emit(&mut out, "BogoMIPS\t\t: 1238.63");
            }
            "uname -a" => emit(
                &mut out,
                "Linux buildroot 4.5.0-2-4kc-malta #1 Debian 4.5.5-1 (2016-05-29) mips GNU/Linux",
            ),
            "reboot" => {
                emit(&mut out, "The system is going down NOW!");
                emit(&mut out, "reboot: Restarting system");
                std::process::exit(0);
            }
            "halt" => {
                emit(&mut out, "reboot: System halted");
                hang();
            }
            "crash" => std::process::exit(3),
            _ => match line.strip_prefix("echo ") {
                Some(text) => emit(&mut out, text),
                None => {
                    let name = line.split_whitespace().next().unwrap_or(line);
                    emit(&mut out, &format!("sh: {}: not found", name));
                }
            },
        }
        prompt(&mut out);
    }
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

/// Read up to a `\r` or `\n`; `None` on EOF with nothing pending
fn read_line<R: Read>(reader: &mut R) -> Option<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) | Err(_) => {
                return if line.is_empty() {
                    None
                } else {
                    Some(String::from_utf8_lossy(&line).into_owned())
                };
            }
            Ok(_) if byte[0] == b'\r' || byte[0] == b'\n' => {
                return Some(String::from_utf8_lossy(&line).into_owned());
            }
            Ok(_) => line.push(byte[0]),
        }
    }
}

fn emit<W: Write>(out: &mut W, line: &str) {
    let _ = write!(out, "{}\r\n", line);
    let _ = out.flush();
}

fn prompt<W: Write>(out: &mut W) {
    let _ = out.write_all(PROMPT.as_bytes());
    let _ = out.flush();
}

fn hang() -> ! {
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}
