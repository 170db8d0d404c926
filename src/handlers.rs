use crate::controller::CampaignController;
use crate::error::DispatchError;
use crate::model::{CampaignSnapshot, DeliveryStatus};
use anyhow::Result;
use teloxide::prelude::*;
use tracing::{info, instrument, warn};

const LIST_LIMIT: i64 = 10;
const LOG_LIMIT: usize = 15;

/// Operator commands understood by the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    Help,
    List,
    Running,
    Status(String),
    Send(String),
    Pause(String),
    Resume(String),
    Cancel(String),
    Log(String, Option<DeliveryStatus>),
}

/// Parse a slash command. `Err` carries the reply for malformed input; `Ok(None)`
/// means the text is not a command at all.
pub fn parse_command(text: &str) -> Result<Option<Command>, &'static str> {
    let trimmed = text.trim();
    if !trimmed.starts_with('/') {
        return Ok(None);
    }
    let mut parts = trimmed.split_whitespace();
    // Drop a "@botname" suffix on the command word.
    let word = parts
        .next()
        .map(|w| w.split('@').next().unwrap_or(w))
        .unwrap_or_default();
    let arg = parts.next().map(str::to_string);
    let extra = parts.next();

    let need_id = |arg: Option<String>| arg.ok_or("This command needs a campaign id.");
    let command = match word {
        "/ping" => Command::Ping,
        "/start" | "/help" => Command::Help,
        "/campaigns" => Command::List,
        "/running" => Command::Running,
        "/status" => Command::Status(need_id(arg)?),
        "/send" => Command::Send(need_id(arg)?),
        "/pause" => Command::Pause(need_id(arg)?),
        "/resume" => Command::Resume(need_id(arg)?),
        "/cancel" => Command::Cancel(need_id(arg)?),
        "/log" => {
            let filter = match extra {
                Some(s) => Some(DeliveryStatus::parse_state(s).ok_or("Unknown delivery status.")?),
                None => None,
            };
            Command::Log(need_id(arg)?, filter)
        }
        _ => return Err("Unknown command."),
    };
    Ok(Some(command))
}

pub fn help_text() -> &'static str {
    "/campaigns - recent campaigns\n\
     /running - loops running in this process\n\
     /status <id> - campaign progress\n\
     /send <id> - start sending\n\
     /pause <id> - pause sending\n\
     /resume <id> - resume a paused campaign\n\
     /cancel <id> - cancel for good\n\
     /log <id> [pending|sending|success|error] - delivery log\n\
     /ping - health check"
}

pub fn format_snapshot(s: &CampaignSnapshot) -> String {
    let st = &s.statistics;
    format!(
        "{} ({})\nstatus: {}{}\nsent {}/{} - success {} - error {} - pending {} - rate {:.1}%",
        s.name,
        s.id,
        s.status,
        if s.running_locally { " (running here)" } else { "" },
        st.sent,
        st.total,
        st.success,
        st.error,
        st.pending,
        st.success_rate
    )
}

fn describe_error(err: &DispatchError) -> String {
    match err {
        DispatchError::Persistence(_) | DispatchError::Systemic(_) => {
            "Internal error, see logs.".to_string()
        }
        other => other.to_string(),
    }
}

#[instrument(skip_all)]
pub async fn handle_update(
    bot: &Bot,
    controller: &CampaignController,
    allowed_users: &[i64],
    msg: &Message,
) -> Result<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let tg_user_id = user.id.0 as i64;

    let command = match parse_command(text) {
        Ok(Some(command)) => command,
        Ok(None) => return Ok(()),
        Err(reply) => {
            let _ = bot.send_message(msg.chat.id, reply).await;
            return Ok(());
        }
    };

    if !allowed_users.contains(&tg_user_id) && command != Command::Ping {
        warn!(tg_user_id, "rejected command from unauthorized user");
        let _ = bot.send_message(msg.chat.id, "Not authorized.").await;
        return Ok(());
    }
    info!(tg_user_id, ?command, "operator command");

    let reply = match execute(controller, command).await {
        Ok(reply) => reply,
        Err(err) => {
            warn!(%err, "operator command failed");
            describe_error(&err)
        }
    };
    let _ = bot.send_message(msg.chat.id, reply).await;
    Ok(())
}

/// Run a parsed command and render the reply.
pub async fn execute(
    controller: &CampaignController,
    command: Command,
) -> Result<String, DispatchError> {
    let reply = match command {
        Command::Ping => "PONG".to_string(),
        Command::Help => help_text().to_string(),
        Command::List => {
            let campaigns = controller.list(LIST_LIMIT).await?;
            if campaigns.is_empty() {
                "No campaigns.".to_string()
            } else {
                campaigns
                    .iter()
                    .map(|c| {
                        format!(
                            "{} - {} [{}] {}/{}",
                            c.id, c.name, c.status, c.statistics.sent, c.statistics.total
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
        Command::Running => {
            let running = controller.running();
            if running.is_empty() {
                "Nothing running here.".to_string()
            } else {
                running
                    .iter()
                    .map(|r| {
                        format!(
                            "{} since {} (heartbeat {})",
                            r.campaign_id,
                            r.started_at.format("%H:%M:%S"),
                            r.last_heartbeat.format("%H:%M:%S")
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
        Command::Status(id) => format_snapshot(&controller.status(&id).await?),
        Command::Send(id) => format!(
            "Started.\n{}",
            format_snapshot(&controller.start(&id).await?.snapshot)
        ),
        Command::Pause(id) => format!("Paused.\n{}", format_snapshot(&controller.pause(&id).await?)),
        Command::Resume(id) => format!(
            "Resumed.\n{}",
            format_snapshot(&controller.resume(&id).await?.snapshot)
        ),
        Command::Cancel(id) => format!(
            "Cancelled.\n{}",
            format_snapshot(&controller.cancel(&id).await?)
        ),
        Command::Log(id, filter) => {
            let entries = controller.delivery_log(&id, filter).await?;
            if entries.is_empty() {
                "No matching deliveries.".to_string()
            } else {
                let mut lines: Vec<String> = entries
                    .iter()
                    .take(LOG_LIMIT)
                    .map(|e| {
                        let mut line = format!(
                            "#{} {} {} x{}",
                            e.position, e.number, e.status, e.attempts
                        );
                        if let Some(message) = &e.error_message {
                            line.push_str(&format!(" - {message}"));
                        }
                        line
                    })
                    .collect();
                if entries.len() > LOG_LIMIT {
                    lines.push(format!("... and {} more", entries.len() - LOG_LIMIT));
                }
                lines.join("\n")
            }
        }
    };
    Ok(reply)
}
