//! Boot command rendering, parsing and typing.
//!
//! A boot command is the scripted keystroke sequence that answers an
//! unattended installer's text-mode prompt. It mixes literal characters
//! with angle-bracket tags (`<enter>`, `<wait5>`, ...) and supports
//! template interpolation of per-build data before parsing.

use std::time::Duration;

use color_eyre::eyre::bail;
use color_eyre::Result;
use tracing::debug;

use crate::rfb::{RfbClient, KEYSYM_SHIFT};
use crate::wait::{interruptible_sleep, CancelToken, WaitOutcome};

/// One parsed element of a boot command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootAction {
    /// Press and release a key, wrapping it in Shift when `shifted`.
    Key {
        /// X11 keysym to send.
        keysym: u32,
        /// Whether the key needs the Shift modifier held.
        shifted: bool,
    },
    /// Pause between keystrokes.
    Wait(Duration),
}

/// Per-build values interpolated into the boot command template.
#[derive(Debug, Clone)]
pub struct TemplateData {
    /// VM name, for `{{ .Name }}`.
    pub name: String,
    /// Install-media HTTP server address, for `{{ .HTTPIP }}`.
    pub http_ip: String,
    /// Install-media HTTP server port, for `{{ .HTTPPort }}`.
    pub http_port: u16,
}

/// Substitute `{{ .Name }}`, `{{ .HTTPIP }}` and `{{ .HTTPPort }}`.
pub fn render(template: &str, data: &TemplateData) -> String {
    let mut rendered = template.to_string();
    for (tag, value) in [
        ("Name", data.name.as_str()),
        ("HTTPIP", data.http_ip.as_str()),
        ("HTTPPort", &data.http_port.to_string()),
    ] {
        rendered = rendered
            .replace(&format!("{{{{ .{tag} }}}}"), value)
            .replace(&format!("{{{{.{tag}}}}}"), value);
    }
    rendered
}

/// Parse a rendered boot command into typeable actions.
pub fn parse_boot_command(command: &str) -> Result<Vec<BootAction>> {
    let mut actions = Vec::new();
    let mut chars = command.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '<' {
            actions.push(key_for_char(c)?);
            continue;
        }
        let mut tag = String::new();
        loop {
            match chars.next() {
                Some('>') => break,
                Some(c) => tag.push(c),
                None => bail!("boot command has an unterminated '<{tag}' tag"),
            }
        }
        actions.push(action_for_tag(&tag)?);
    }
    Ok(actions)
}

fn action_for_tag(tag: &str) -> Result<BootAction> {
    let keysym = match tag.to_ascii_lowercase().as_str() {
        "enter" | "return" => 0xff0d,
        "esc" => 0xff1b,
        "tab" => 0xff09,
        "spacebar" => return Ok(key(0x20)),
        "bs" => 0xff08,
        "del" => 0xffff,
        "up" => 0xff52,
        "down" => 0xff54,
        "left" => 0xff51,
        "right" => 0xff53,
        "f1" => 0xffbe,
        "f2" => 0xffbf,
        "f3" => 0xffc0,
        "f4" => 0xffc1,
        "f5" => 0xffc2,
        "f6" => 0xffc3,
        "f7" => 0xffc4,
        "f8" => 0xffc5,
        "f9" => 0xffc6,
        "f10" => 0xffc7,
        "f11" => 0xffc8,
        "f12" => 0xffc9,
        "wait" => return Ok(BootAction::Wait(Duration::from_secs(1))),
        "wait5" => return Ok(BootAction::Wait(Duration::from_secs(5))),
        "wait10" => return Ok(BootAction::Wait(Duration::from_secs(10))),
        other => {
            if let Some(spec) = other.strip_prefix("wait") {
                return Ok(BootAction::Wait(parse_wait(spec, tag)?));
            }
            bail!("boot command has an unknown tag '<{tag}>'");
        }
    };
    Ok(key(keysym))
}

fn parse_wait(spec: &str, tag: &str) -> Result<Duration> {
    let (digits, unit) = match spec.strip_suffix("ms") {
        Some(digits) => (digits, Duration::from_millis(1)),
        None => match spec.strip_suffix('s') {
            Some(digits) => (digits, Duration::from_secs(1)),
            None => bail!("boot command wait tag '<{tag}>' needs an 's' or 'ms' suffix"),
        },
    };
    match digits.parse::<u32>() {
        Ok(n) => Ok(unit * n),
        Err(_) => bail!("boot command wait tag '<{tag}>' has an invalid duration"),
    }
}

fn key(keysym: u32) -> BootAction {
    BootAction::Key {
        keysym,
        shifted: false,
    }
}

const SHIFTED_SYMBOLS: &str = "~!@#$%^&*()_+{}|:\"<>?";

fn key_for_char(c: char) -> Result<BootAction> {
    let shifted = c.is_ascii_uppercase() || SHIFTED_SYMBOLS.contains(c);
    let code = c as u32;
    let keysym = match code {
        // Latin-1 keysyms equal the codepoint; newline types as Return.
        0x0a => 0xff0d,
        0x20..=0xff => code,
        // Keysyms beyond latin-1 follow the X11 unicode rule.
        0x100.. => 0x0100_0000 + code,
        _ => bail!("boot command contains an untypeable control character {code:#x}"),
    };
    Ok(BootAction::Key { keysym, shifted })
}

/// Type `actions` over `client`, pausing `key_interval` between keys.
///
/// Cancellation is honored at every pause; a failed key event aborts the
/// sequence, since install prompts are not resumable mid-script.
pub fn type_sequence(
    client: &mut RfbClient,
    actions: &[BootAction],
    key_interval: Duration,
    cancel: &CancelToken,
) -> Result<()> {
    debug!("typing {} boot command actions", actions.len());
    for action in actions {
        match action {
            BootAction::Key { keysym, shifted } => {
                if *shifted {
                    client.key_event(KEYSYM_SHIFT, true)?;
                }
                client.press_key(*keysym)?;
                if *shifted {
                    client.key_event(KEYSYM_SHIFT, false)?;
                }
                if interruptible_sleep(key_interval, cancel) == WaitOutcome::Cancelled {
                    bail!("boot command typing was cancelled");
                }
            }
            BootAction::Wait(pause) => {
                if interruptible_sleep(*pause, cancel) == WaitOutcome::Cancelled {
                    bail!("boot command typing was cancelled");
                }
            }
        }
    }
    Ok(())
}
