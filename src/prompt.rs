//! Terminal prompts

use dialoguer::Confirm;

use crate::auth::{AuthError, SetupPrompt};

/// Asks on the controlling terminal before the first sign-in.
pub struct ConsolePrompt;

impl SetupPrompt for ConsolePrompt {
    fn ask_setup_account(&self) -> Result<bool, AuthError> {
        Confirm::new()
            .with_prompt("No Microsoft account is set up yet. Sign in now?")
            .default(true)
            .interact()
            .map_err(|e| AuthError::Terminal(std::io::Error::other(e.to_string())))
    }
}
