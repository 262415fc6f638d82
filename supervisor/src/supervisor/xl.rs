//! xl toolstack hypervisor driver
//!
//! Each verb spawns the `xl` binary, waits for it and checks the exit
//! status; domain observation parses the table printed by `xl list`.
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::anyhow;

use mcp_core::error::{ErrorKind, ResultExt, TypedError, TypedResult};
use mcp_core::hypervisor::{flags, DomainInfo, Hypervisor};

pub struct XlHypervisor {
    xl: PathBuf,
}

impl XlHypervisor {
    pub fn new(xl: PathBuf) -> Self {
        Self { xl }
    }

    fn run(&self, args: &[&str]) -> TypedResult<()> {
        let status = Command::new(&self.xl)
            .args(args)
            .status()
            .typ(ErrorKind::Io)?;
        if !status.success() {
            return Err(TypedError::new(
                ErrorKind::ExternalCommandFailed,
                anyhow!("\"xl {}\" failed: {status}", args.join(" ")),
            ));
        }
        Ok(())
    }

    fn capture(&self, args: &[&str]) -> TypedResult<String> {
        let output = Command::new(&self.xl)
            .args(args)
            .output()
            .typ(ErrorKind::Io)?;
        if !output.status.success() {
            return Err(TypedError::new(
                ErrorKind::ExternalCommandFailed,
                anyhow!("\"xl {}\" failed: {}", args.join(" "), output.status),
            ));
        }
        String::from_utf8(output.stdout).typ(ErrorKind::ExternalCommandFailed)
    }
}

/// Decodes an `xl list` state column ("r-----", "--p---", ...) into domain
/// flag bits; a crashed domain counts as shut down
fn flags_from_state(state: &str) -> u32 {
    let mut bits = 0;
    for c in state.chars() {
        match c {
            'r' => bits |= flags::RUNNING,
            'b' => bits |= flags::BLOCKED,
            'p' => bits |= flags::PAUSED,
            's' | 'c' => bits |= flags::SHUTDOWN,
            'd' => bits |= flags::DYING,
            _ => {}
        }
    }
    bits
}

/// Parses the domain table printed by `xl list`
///
/// The header row and anything that does not look like a domain row are
/// skipped.
fn parse_list(text: &str) -> Vec<(String, DomainInfo)> {
    let mut rows = Vec::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 {
            continue;
        }
        let Ok(id) = fields[1].parse::<u32>() else {
            continue;
        };
        rows.push((
            fields[0].to_string(),
            DomainInfo {
                id,
                flags: flags_from_state(fields[4]),
            },
        ));
    }
    rows
}

impl Hypervisor for XlHypervisor {
    fn open(&self) -> TypedResult<()> {
        if !self.xl.exists() {
            return Err(TypedError::new(
                ErrorKind::NotFound,
                anyhow!("xl binary {} does not exist", self.xl.display()),
            ));
        }
        Ok(())
    }

    fn close(&self) {}

    fn create(&self, config: &Path) -> TypedResult<()> {
        let config = config.display().to_string();
        self.run(&["create", "-qp", &config])
    }

    fn destroy(&self, name: &str) -> TypedResult<()> {
        self.run(&["destroy", name])
    }

    fn pause(&self, name: &str) -> TypedResult<()> {
        self.run(&["pause", name])
    }

    fn unpause(&self, name: &str) -> TypedResult<()> {
        self.run(&["unpause", name])
    }

    fn reboot(&self, name: &str) -> TypedResult<()> {
        self.run(&["reboot", name])
    }

    fn set_sched_timeslice(&self, timeslice_ms: u32) -> TypedResult<()> {
        self.run(&["sched-credit", "-s", "-t", &timeslice_ms.to_string()])
    }

    fn set_sched_weight_cap(&self, name: &str, weight: u32, cap: u32) -> TypedResult<()> {
        self.run(&[
            "sched-credit",
            "-d",
            name,
            "-w",
            &weight.to_string(),
            "-c",
            &cap.to_string(),
        ])
    }

    fn list(&self) -> TypedResult<String> {
        self.capture(&["list"])
    }

    fn get_info_list(&self, first: u32, count: u32) -> TypedResult<Vec<DomainInfo>> {
        let text = self.capture(&["list"])?;
        Ok(parse_list(&text)
            .into_iter()
            .map(|(_, info)| info)
            .filter(|info| info.id >= first)
            .take(count as usize)
            .collect())
    }

    fn name_for_id(&self, id: u32) -> Option<String> {
        let text = self.capture(&["list"]).ok()?;
        parse_list(&text)
            .into_iter()
            .find(|(_, info)| info.id == id)
            .map(|(name, _)| name)
    }
}

#[cfg(test)]
mod test {
    use mcp_core::hypervisor::{state_from_flags, HvState};

    use super::*;

    const LISTING: &str = "\
Name                                        ID   Mem VCPUs\tState\tTime(s)
Domain-0                                     0  4096     4     r-----     157.4
p1                                           1   512     1     --p---       0.0
p2                                           2   512     2     -b----      12.9
broken                                       3   128     1     --ps-d       3.1
";

    #[test]
    fn parses_domain_rows() {
        let rows = parse_list(LISTING);
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].0, "Domain-0");
        assert_eq!(rows[0].1.id, 0);
        assert_eq!(rows[2], ("p2".to_string(), DomainInfo { id: 2, flags: flags::BLOCKED }));
    }

    #[test]
    fn state_letters_decode_with_priority() {
        let rows = parse_list(LISTING);
        assert_eq!(state_from_flags(rows[0].1.flags), HvState::Running);
        assert_eq!(state_from_flags(rows[1].1.flags), HvState::Paused);
        assert_eq!(state_from_flags(rows[2].1.flags), HvState::Blocked);
        // Dying outranks paused and shut down.
        assert_eq!(state_from_flags(rows[3].1.flags), HvState::Dying);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        assert!(parse_list("").is_empty());
        assert!(parse_list("no domains\n").is_empty());
        assert!(parse_list("Name ID Mem VCPUs State Time(s)\n").is_empty());
    }
}
