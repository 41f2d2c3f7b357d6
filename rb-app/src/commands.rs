//! Admin commands for trusted senders.

use crate::controls::BotControls;
use crate::store::BlacklistChange;

pub const HELP_TEXT: &str = "Commands:\n\n\
/help: this message\n\
/block (+#): blocks, unblocks, list\n\
/bot (on/off): enables, disables, status\n\n\
* text: ai reply";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    Help,
    BotStatus,
    BotOn,
    BotOff,
    BlockList,
    BlockToggle(String),
}

/// Recognize an admin command. Command words and `on`/`off` are
/// case-insensitive; block targets are kept verbatim.
pub fn parse_admin_command(input: &str) -> Option<AdminCommand> {
    let trimmed = input.trim();
    if trimmed == "?" {
        return Some(AdminCommand::Help);
    }

    let (word, arg) = match trimmed.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (trimmed, ""),
    };

    match word.to_ascii_lowercase().as_str() {
        "/help" => Some(AdminCommand::Help),
        "/bot" => Some(match arg.to_ascii_lowercase().as_str() {
            "on" => AdminCommand::BotOn,
            "off" => AdminCommand::BotOff,
            _ => AdminCommand::BotStatus,
        }),
        "/block" if arg.is_empty() => Some(AdminCommand::BlockList),
        "/block" => Some(AdminCommand::BlockToggle(arg.to_string())),
        _ => None,
    }
}

/// Text after a leading `*`, the explicit trigger trusted senders use to get a
/// reply to their own message.
pub fn strip_trigger(input: &str) -> Option<&str> {
    input.trim_start().strip_prefix('*').map(str::trim)
}

/// Handle `input` from a trusted sender. `Some(reply)` means the message was
/// an admin command and is fully handled; `None` leaves it to the caller.
pub async fn handle_admin(controls: &BotControls, input: &str) -> Option<String> {
    let command = parse_admin_command(input)?;
    tracing::info!(?command, "admin command");
    Some(execute(controls, command).await)
}

async fn execute(controls: &BotControls, command: AdminCommand) -> String {
    match command {
        AdminCommand::Help => HELP_TEXT.to_string(),
        AdminCommand::BotStatus => {
            let status = if controls.is_disabled().await {
                "Disabled"
            } else {
                "Enabled"
            };
            format!("Status: {status}")
        }
        AdminCommand::BotOn => match controls.set_disabled(false).await {
            Ok(()) => "Bot Enabled".to_string(),
            Err(e) => {
                tracing::warn!(%e, "enable failed");
                format!("Error: {e}")
            }
        },
        AdminCommand::BotOff => match controls.set_disabled(true).await {
            Ok(()) => "Bot Disabled".to_string(),
            Err(e) => {
                tracing::warn!(%e, "disable failed");
                format!("Error: {e}")
            }
        },
        AdminCommand::BlockList => {
            format!("Blocked: {:?}", controls.blocked().await)
        }
        AdminCommand::BlockToggle(target) => {
            let (change, saved) = controls.toggle_block(&target).await;
            if let Err(e) = saved {
                tracing::warn!(%e, target = %target, "blacklist save failed");
            }
            match change {
                BlacklistChange::Added => format!("Blocked {target}"),
                BlacklistChange::Removed => format!("Unblocked {target}"),
            }
        }
    }
}
