//! The monitor-command registry. Drivers register textual commands per
//! group; the GDB front-end routes `qRcmd` lines here. A handler prints
//! its own output (or a one-line error) and returns true on success.

use core::fmt::Write;

use nom::branch::alt;
use nom::bytes::complete::{tag, tag_no_case, take_while1};
use nom::character::complete::{digit1, hex_digit1};
use nom::combinator::map_res;
use nom::sequence::preceded;
use nom::IResult;

use crate::flasher::Flasher;
use crate::target::Target;
use crate::time::Progress;

pub struct Command {
    pub name: &'static str,
    pub handler: fn(&mut Target, &mut dyn Write, &str) -> bool,
    pub help: &'static str,
}

/// Commands available on every target regardless of driver.
pub static GLOBAL_COMMANDS: &[Command] = &[
    Command {
        name: "help",
        handler: cmd_help,
        help: "Display help for monitor commands",
    },
    Command {
        name: "erase_mass",
        handler: cmd_erase_mass,
        help: "Erase whole device Flash",
    },
];

fn token(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace())(input)
}

fn hex_u32(input: &str) -> IResult<&str, u32> {
    preceded(
        alt((tag_no_case("0x"), tag("$"))),
        map_res(hex_digit1, |s: &str| u32::from_str_radix(s, 16)),
    )(input)
}

fn dec_u32(input: &str) -> IResult<&str, u32> {
    map_res(digit1, |s: &str| s.parse::<u32>())(input)
}

/// Parses one numeric argument, `0x`/`$`-prefixed hex or decimal.
pub fn parse_u32(arg: &str) -> Option<u32> {
    let (rest, value) = alt((hex_u32, dec_u32))(arg.trim()).ok()?;
    if rest.is_empty() {
        Some(value)
    } else {
        None
    }
}

/// Splits a command line into its first token and the remaining
/// argument string.
pub fn split_command(line: &str) -> Option<(&str, &str)> {
    let (rest, name) = token(line.trim()).ok()?;
    Some((name, rest.trim_start()))
}

/// Looks the command up across the target's groups and the global
/// table, in registration order. Returns `None` for an unknown command,
/// otherwise the handler's verdict.
pub fn dispatch(target: &mut Target, out: &mut dyn Write, line: &str) -> Option<bool> {
    let (name, args) = split_command(line)?;
    let mut handler = None;
    for group in target.command_groups() {
        if let Some(cmd) = group.table.iter().find(|c| c.name == name) {
            handler = Some(cmd.handler);
            break;
        }
    }
    if handler.is_none() {
        handler = GLOBAL_COMMANDS
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.handler);
    }
    let handler = handler?;
    Some(handler(target, out, args))
}

fn cmd_help(target: &mut Target, out: &mut dyn Write, _args: &str) -> bool {
    let _ = writeln!(out, "General commands:");
    for cmd in GLOBAL_COMMANDS {
        let _ = writeln!(out, "\t{} -- {}", cmd.name, cmd.help);
    }
    for group in target.command_groups() {
        let _ = writeln!(out, "{} specific commands:", group.label);
        for cmd in group.table {
            let _ = writeln!(out, "\t{} -- {}", cmd.name, cmd.help);
        }
    }
    true
}

fn cmd_erase_mass(target: &mut Target, out: &mut dyn Write, _args: &str) -> bool {
    let result = {
        let mut sink = |_n: u32| {
            let _ = out.write_str(".");
        };
        let mut progress = Progress::new(&mut sink);
        Flasher::mass_erase(target, &mut progress)
    };
    match result {
        Ok(()) => {
            let _ = writeln!(out, "\nerase complete");
            true
        }
        Err(e) => {
            let _ = writeln!(out, "\nerase failed: {}", e);
            false
        }
    }
}
