use chrono::{DateTime, TimeZone};
use roster_core::{PresenceRecord, PresenceView, ViewState};
use std::fmt::{Display, Write};

/// Text form of the roster.
///
/// `users` is the set to show, already re-filtered by the caller at its own
/// time of reading; the view supplies the loading and error states.
pub fn render_roster<Tz>(
    view: &PresenceView,
    users: &[PresenceRecord],
    me: Option<&str>,
    tz: &Tz,
) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let mut out = String::new();
    match view.state() {
        ViewState::Loading => out.push_str("Loading users...\n"),
        ViewState::Error => {
            out.push_str("Error\n");
            if let Some(message) = &view.error {
                let _ = writeln!(out, "{message}");
            }
        }
        ViewState::Ready => {
            let _ = writeln!(out, "Online Users ({})", users.len());
            if users.is_empty() {
                out.push_str("No users currently online\n");
            }
            let width = users
                .iter()
                .map(|user| user.username.chars().count())
                .max()
                .unwrap_or(0);
            for user in users {
                let badge = if me == Some(user.email.as_str()) {
                    "You"
                } else {
                    "Online"
                };
                let _ = writeln!(
                    out,
                    "  {:<width$}  {:<6}  last seen {}",
                    user.username,
                    badge,
                    clock_time(&user.last_seen, tz),
                );
            }
        }
    }
    out
}

fn clock_time<Tz>(at: &DateTime<chrono::Utc>, tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    at.with_timezone(tz).format("%H:%M:%S").to_string()
}
