const MAX_LOG_LINES: usize = 500;

#[derive(Debug, PartialEq, Eq)]
pub enum LogLineEvent {
    Started,
    ConnectError,
    PostConnectError,
    Normal,
}

pub fn classify_log_line(line: &str, already_started: bool) -> LogLineEvent {
    let lower = line.to_lowercase();

    if !already_started
        && ((lower.contains("core: xray") && lower.contains("started"))
            || lower.contains("sing-box started")
            || (lower.contains("listening") && lower.contains("socks")))
    {
        return LogLineEvent::Started;
    }

    if !already_started
        && (lower.starts_with("error:")
            || lower.contains("failed to start")
            || lower.contains("failed to load config")
            || lower.contains("failed to listen")
            || lower.contains("address already in use")
            || lower.contains("infra/conf:")
            || lower.contains("invalid")
            || lower.contains("panic:"))
    {
        return LogLineEvent::ConnectError;
    }

    if already_started
        && (lower.contains("failed to process outbound traffic")
            || lower.contains("reality: processed invalid connection")
            || lower.contains("tls: handshake failure")
            || (lower.contains("connection") && lower.contains("refused")))
    {
        return LogLineEvent::PostConnectError;
    }

    LogLineEvent::Normal
}

pub struct ProcessLog {
    pub lines: Vec<String>,
    pub started: bool,
    pub error: Option<String>,
    pub post_connect_error: Option<String>,
}

impl ProcessLog {
    pub fn new() -> Self {
        Self {
            lines: Vec::new(),
            started: false,
            error: None,
            post_connect_error: None,
        }
    }

    pub fn reset(&mut self) {
        self.lines.clear();
        self.started = false;
        self.error = None;
        self.post_connect_error = None;
    }

    pub fn push_line(&mut self, line: String) -> LogLineEvent {
        let event = classify_log_line(&line, self.started);
        match event {
            LogLineEvent::Started => {
                log::info!("[detect] engine started: {line}");
                self.started = true;
            }
            LogLineEvent::ConnectError => {
                log::warn!("[detect] start-phase error: {line}");
                if self.error.is_none() {
                    self.error = Some(line.clone());
                }
            }
            LogLineEvent::PostConnectError => {
                if self.post_connect_error.is_none() {
                    log::warn!("[detect] post-connect error: {line}");
                    self.post_connect_error = Some(line.clone());
                }
            }
            LogLineEvent::Normal => {}
        }

        self.lines.push(line);
        if self.lines.len() > MAX_LOG_LINES {
            self.lines.remove(0);
        }
        event
    }
}

impl Default for ProcessLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_xray_startup_banner() {
        assert_eq!(
            classify_log_line("2024/05/01 10:00:00 [Warning] core: Xray 1.8.11 started", false),
            LogLineEvent::Started
        );
    }

    #[test]
    fn start_phase_errors_only_count_before_startup() {
        let line = "Failed to start: main: failed to load config files";
        assert_eq!(classify_log_line(line, false), LogLineEvent::ConnectError);
        assert_eq!(classify_log_line(line, true), LogLineEvent::Normal);
    }

    #[test]
    fn post_connect_errors_only_count_after_startup() {
        let line = "[Info] app/proxyman/outbound: failed to process outbound traffic";
        assert_eq!(classify_log_line(line, true), LogLineEvent::PostConnectError);
        assert_eq!(classify_log_line(line, false), LogLineEvent::Normal);
    }

    #[test]
    fn keeps_first_error_and_bounds_history() {
        let mut log = ProcessLog::new();
        log.push_line("error: first".into());
        log.push_line("error: second".into());
        assert_eq!(log.error.as_deref(), Some("error: first"));

        for index in 0..MAX_LOG_LINES + 10 {
            log.push_line(format!("line {index}"));
        }
        assert_eq!(log.lines.len(), MAX_LOG_LINES);

        log.reset();
        assert!(log.lines.is_empty());
        assert!(log.error.is_none());
        assert!(!log.started);
    }
}
