use std::io::Write;

use crate::{
    Error,
    config::Config,
    error,
    libby::{
        AuthState, CodePrompt, LibbyClient,
        auth::{FixedCode, is_valid_code},
    },
    info, success, warning,
};

const LIBBY_URL: &str = "https://libbyapp.com";

/// Reads the linking code from the terminal.
pub struct TerminalPrompt {
    pub open_browser: bool,
}

impl CodePrompt for TerminalPrompt {
    fn show_code(&mut self, code: Option<&str>) {
        info!("Open Libby on a device that is already set up and go to");
        info!("Menu > Settings > Copy To Another Device to get an 8-digit code.");
        if let Some(code) = code {
            info!("This device was issued the code {}.", code);
        }
        if self.open_browser && webbrowser::open(LIBBY_URL).is_err() {
            warning!("Cannot open a browser. Visit {} manually.", LIBBY_URL);
        }
    }

    fn read_code(&mut self, attempt: u32) -> Option<String> {
        if attempt > 1 {
            warning!("That is not an 8-digit code. Try again.");
        }
        print!("Enter the code: ");
        std::io::stdout().flush().ok()?;
        let mut line = String::new();
        match std::io::stdin().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim().replace(' ', "")),
        }
    }
}

/// Sets up, checks or resets the Libby session.
pub async fn auth(config: Config, check: bool, reset: bool, code: Option<String>, open_browser: bool) {
    let mut client = match LibbyClient::new(config) {
        Ok(client) => client,
        Err(e) => error!("Cannot create client. Err: {}", e),
    };

    if reset {
        match client.store().reset().await {
            Ok(()) => success!("Removed {}", client.store().path().display()),
            Err(e) => error!("Cannot remove settings. Err: {}", e),
        }
        if !check && code.is_none() {
            return;
        }
    }

    if check {
        if !client.store().exists() {
            error!("{}", Error::NotConfigured);
        }
        let state = match client.load_session().await {
            Ok(()) => client.check().await,
            Err(e) => Err(e),
        };
        match state {
            Ok(AuthState::Synced) => success!("Libby session is valid."),
            Ok(other) => warning!("Libby session is in state {:?}.", other),
            Err(e) => error!("{}", e),
        }
        return;
    }

    if let Some(code) = &code {
        if !is_valid_code(code) {
            error!("Invalid code {:?}. Expected 8 digits.", code);
        }
    }

    let mut prompt: Box<dyn CodePrompt> = match code {
        Some(code) => Box::new(FixedCode(code)),
        None => Box::new(TerminalPrompt { open_browser }),
    };

    match client.ensure_session(true, prompt.as_mut()).await {
        Ok(_) => {
            let cards = client.session().cards.len();
            if cards > 0 {
                success!("Login successful. {} library card(s) linked.", cards);
            } else {
                success!("Already logged in.");
            }
        }
        Err(e) => error!("{}", e),
    }
}
