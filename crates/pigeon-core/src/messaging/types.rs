/// Text markup of an outgoing message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ParseMode {
    /// No entities; the text goes out as is.
    Plain,
    #[default]
    Html,
}

/// Keyboard attached to an outgoing message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Keyboard {
    #[default]
    None,
    /// Persistent reply keyboard, one button per row.
    Reply(Vec<String>),
    /// Hide a previously shown reply keyboard.
    Remove,
}

/// Per-call options of send / edit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub parse_mode: ParseMode,
    pub keyboard: Keyboard,
    pub protect_content: bool,
}

impl SendOptions {
    pub fn html() -> Self {
        Self::default()
    }

    pub fn plain() -> Self {
        Self {
            parse_mode: ParseMode::Plain,
            ..Self::default()
        }
    }

    pub fn with_keyboard(mut self, keyboard: Keyboard) -> Self {
        self.keyboard = keyboard;
        self
    }

    pub fn protected(mut self) -> Self {
        self.protect_content = true;
        self
    }
}
