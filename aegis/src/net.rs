//! Kernel networking plane for the tap backend.
//!
//! One /30 per VM: tap device `aegis<N>`, host side `.1`, guest `.2`,
//! MASQUERADE + FORWARD rules tagged with an `aegis-<N>` comment so a crash
//! sweep can find them again. All `ip`/`iptables` invocations are serialized
//! behind one mutex — concurrent iptables runs race each other.

use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::Mutex;

use aegis_shared::errors::{AegisError, AegisResult};

use crate::vmm::subnet::SubnetSlot;

/// Comment tag prefix on every rule this daemon installs.
const RULE_TAG: &str = "aegis-managed";

/// Serialized access to the host network configuration.
#[derive(Clone)]
pub struct NetPlane {
    lock: Arc<Mutex<()>>,
}

impl NetPlane {
    pub fn new() -> Self {
        Self {
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Create and bring up the tap device for a slot.
    pub async fn create_tap(&self, slot: &SubnetSlot) -> AegisResult<()> {
        let _guard = self.lock.lock().await;
        let tap = slot.tap_name();
        run("ip", &["tuntap", "add", &tap, "mode", "tap"]).await?;
        let result = async {
            run(
                "ip",
                &["addr", "add", &format!("{}/30", slot.host_ip()), "dev", &tap],
            )
            .await?;
            run("ip", &["link", "set", &tap, "up"]).await
        }
        .await;
        if result.is_err() {
            // Partial setup: take the device back down before surfacing.
            let _ = run("ip", &["tuntap", "del", &tap, "mode", "tap"]).await;
        }
        result
    }

    /// Delete a tap device; tolerates absence.
    pub async fn delete_tap(&self, tap: &str) -> AegisResult<()> {
        let _guard = self.lock.lock().await;
        match run("ip", &["tuntap", "del", tap, "mode", "tap"]).await {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("Cannot find device") => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Install MASQUERADE + FORWARD rules for a slot.
    pub async fn add_nat(&self, slot: &SubnetSlot) -> AegisResult<()> {
        let _guard = self.lock.lock().await;
        let tap = slot.tap_name();
        let cidr = slot.cidr();
        let comment = rule_comment(slot.index);

        let added = async {
            run(
                "iptables",
                &[
                    "-t", "nat", "-A", "POSTROUTING", "-s", &cidr, "!", "-o", &tap,
                    "-j", "MASQUERADE", "-m", "comment", "--comment", &comment,
                ],
            )
            .await?;
            run(
                "iptables",
                &[
                    "-A", "FORWARD", "-i", &tap, "-j", "ACCEPT",
                    "-m", "comment", "--comment", &comment,
                ],
            )
            .await?;
            run(
                "iptables",
                &[
                    "-A", "FORWARD", "-o", &tap, "-j", "ACCEPT",
                    "-m", "comment", "--comment", &comment,
                ],
            )
            .await
        }
        .await;

        if added.is_err() {
            drop(_guard);
            let _ = self.remove_nat(slot.index, &tap, &cidr).await;
        }
        added
    }

    /// Remove the rules for a slot; each delete tolerates absence.
    pub async fn remove_nat(&self, index: u16, tap: &str, cidr: &str) -> AegisResult<()> {
        let _guard = self.lock.lock().await;
        let comment = rule_comment(index);
        let _ = run(
            "iptables",
            &[
                "-t", "nat", "-D", "POSTROUTING", "-s", cidr, "!", "-o", tap,
                "-j", "MASQUERADE", "-m", "comment", "--comment", &comment,
            ],
        )
        .await;
        let _ = run(
            "iptables",
            &[
                "-D", "FORWARD", "-i", tap, "-j", "ACCEPT",
                "-m", "comment", "--comment", &comment,
            ],
        )
        .await;
        let _ = run(
            "iptables",
            &[
                "-D", "FORWARD", "-o", tap, "-j", "ACCEPT",
                "-m", "comment", "--comment", &comment,
            ],
        )
        .await;
        Ok(())
    }

    /// Destroy taps and rules left behind by a previous daemon crash.
    ///
    /// Tap devices are listed from `ip -o link show` (name prefix `aegis`);
    /// rules are recognized by their comment tag in `iptables -S` output and
    /// replayed with `-A` rewritten to `-D`.
    pub async fn sweep_orphans(&self) -> AegisResult<Vec<String>> {
        let _guard = self.lock.lock().await;
        let mut removed = Vec::new();

        if let Ok(links) = run_capture("ip", &["-o", "link", "show"]).await {
            for tap in parse_tap_names(&links) {
                tracing::info!(tap = %tap, "sweeping orphaned tap device");
                let _ = run("ip", &["tuntap", "del", &tap, "mode", "tap"]).await;
                removed.push(tap);
            }
        }

        for table_args in [&["-t", "nat", "-S"][..], &["-S"][..]] {
            let Ok(rules) = run_capture("iptables", table_args).await else {
                continue;
            };
            for rule in parse_tagged_rules(&rules) {
                let mut args: Vec<&str> = Vec::new();
                if table_args.len() > 1 {
                    args.extend(["-t", "nat"]);
                }
                args.extend(rule.iter().map(String::as_str));
                tracing::info!(rule = ?rule, "sweeping orphaned NAT rule");
                let _ = run("iptables", &args).await;
            }
        }

        Ok(removed)
    }
}

impl Default for NetPlane {
    fn default() -> Self {
        Self::new()
    }
}

fn rule_comment(index: u16) -> String {
    format!("{RULE_TAG}-{index}")
}

/// Tap names with our prefix from `ip -o link show` output.
fn parse_tap_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            // "17: aegis3: <BROADCAST,...> ..."
            let name = line.split(':').nth(1)?.trim();
            let name = name.split('@').next()?;
            (name.starts_with("aegis") && name[5..].chars().all(|c| c.is_ascii_digit()))
                .then(|| name.to_string())
        })
        .collect()
}

/// Tagged `-A …` rules from `iptables -S`, rewritten as delete argv.
fn parse_tagged_rules(output: &str) -> Vec<Vec<String>> {
    output
        .lines()
        .filter(|line| line.starts_with("-A") && line.contains(RULE_TAG))
        .map(|line| {
            shell_split(line)
                .into_iter()
                .enumerate()
                .map(|(i, tok)| if i == 0 { "-D".to_string() } else { tok })
                .collect()
        })
        .collect()
}

/// Minimal splitter for iptables -S lines (tokens, double-quoted comments).
fn shell_split(line: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in line.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ' ' if !in_quotes => {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

async fn run(binary: &str, args: &[&str]) -> AegisResult<()> {
    let output = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| AegisError::Backend(format!("spawn {binary}: {e}")))?;
    if !output.status.success() {
        return Err(AegisError::Backend(format!(
            "{binary} {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

async fn run_capture(binary: &str, args: &[&str]) -> AegisResult<String> {
    let output = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| AegisError::Backend(format!("spawn {binary}: {e}")))?;
    if !output.status.success() {
        return Err(AegisError::Backend(format!(
            "{binary} {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_names_are_parsed_from_link_output() {
        let output = "\
1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN
2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc fq state UP
17: aegis0: <NO-CARRIER,BROADCAST,MULTICAST,UP> mtu 1500 qdisc fq state DOWN
18: aegis12: <NO-CARRIER,BROADCAST,MULTICAST,UP> mtu 1500 qdisc fq state DOWN
19: aegisd0: <BROADCAST> mtu 1500
";
        assert_eq!(parse_tap_names(output), vec!["aegis0", "aegis12"]);
    }

    #[test]
    fn tagged_rules_become_deletes() {
        let output = "\
-P POSTROUTING ACCEPT
-A POSTROUTING -s 10.177.0.0/30 ! -o aegis0 -j MASQUERADE -m comment --comment \"aegis-managed-0\"
-A POSTROUTING -s 192.168.1.0/24 -j MASQUERADE
";
        let rules = parse_tagged_rules(output);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0][0], "-D");
        assert!(rules[0].contains(&"MASQUERADE".to_string()));
        assert!(rules[0].contains(&"aegis-managed-0".to_string()));
    }

    #[test]
    fn shell_split_preserves_quoted_comment() {
        let tokens = shell_split("-A FORWARD -m comment --comment \"aegis-managed-3 extra\"");
        assert_eq!(tokens.last().unwrap(), "aegis-managed-3 extra");
    }
}
