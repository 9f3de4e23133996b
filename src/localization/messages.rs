/// Supported languages for bot-facing UI text.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Lang {
    #[default]
    En,
    He,
}

impl Lang {
    /// Creates Lang from Telegram's language_code (e.g., "he", "en").
    pub fn from_code(code: Option<&str>) -> Self {
        match code {
            Some("he") | Some("iw") => Lang::He,
            _ => Lang::En,
        }
    }
}

// =============================================================================
// Creation flow prompts
// =============================================================================

impl Lang {
    pub fn flow_start(&self) -> &'static str {
        match self {
            Lang::En => "🤖 Welcome! I can build you a new Telegram bot.\n\nTap Create below, use /create_bot, or /cancel at any time to stop.",
            Lang::He => "🤖 ברוכים הבאים! אני יכול לבנות לכם בוט טלגרם חדש.\n\nלחצו על הכפתור למטה, שלחו /create_bot, או /cancel בכל שלב כדי לבטל.",
        }
    }

    pub fn flow_start_button(&self) -> &'static str {
        match self {
            Lang::En => "✨ Create a bot",
            Lang::He => "✨ צרו בוט",
        }
    }

    pub fn flow_waiting_token(&self) -> &'static str {
        match self {
            Lang::En => {
                "Send me the bot token you got from @BotFather.\n\nIt looks like `123456789:ABCDefGhIJKlmNoPQRsTUVwxyZ`."
            }
            Lang::He => {
                "שלחו לי את הטוקן של הבוט שקיבלתם מ-@BotFather.\n\nהוא נראה כך: `123456789:ABCDefGhIJKlmNoPQRsTUVwxyZ`."
            }
        }
    }

    pub fn flow_invalid_token(&self) -> &'static str {
        match self {
            Lang::En => "That doesn't look like a valid bot token. Please send the token exactly as @BotFather gave it to you, or /cancel.",
            Lang::He => "זה לא נראה כמו טוקן תקין. שלחו את הטוקן בדיוק כפי שקיבלתם מ-@BotFather, או /cancel.",
        }
    }

    pub fn flow_token_already_used(&self) -> &'static str {
        match self {
            Lang::En => "This token is already registered to a bot on this service. Please use a different one, or /cancel.",
            Lang::He => "הטוקן הזה כבר רשום לבוט אחר במערכת. השתמשו בטוקן אחר, או /cancel.",
        }
    }

    pub fn flow_waiting_description(&self) -> &'static str {
        match self {
            Lang::En => "Great, token accepted! Now describe what you'd like your bot to do, in a sentence or two.",
            Lang::He => "מעולה, הטוקן אושר! עכשיו תארו במשפט או שניים מה תרצו שהבוט שלכם יעשה.",
        }
    }

    pub fn flow_creating(&self) -> &'static str {
        match self {
            Lang::En => "⏳ Building your bot now, this can take a minute...",
            Lang::He => "⏳ בונה עכשיו את הבוט שלכם, זה עשוי לקחת דקה...",
        }
    }

    pub fn flow_created(&self) -> &'static str {
        match self {
            Lang::En => "✅ Your bot is live! Send it a message to activate it.",
            Lang::He => "✅ הבוט שלכם פעיל! שלחו לו הודעה כדי להפעיל אותו.",
        }
    }

    pub fn flow_created_webhook_pending(&self) -> &'static str {
        match self {
            Lang::En => "✅ Your bot was created. It will come fully online shortly after the next deployment.",
            Lang::He => "✅ הבוט שלכם נוצר. הוא יהיה מחובר במלואו זמן קצר לאחר הפריסה הבאה.",
        }
    }

    pub fn flow_cancelled(&self) -> &'static str {
        match self {
            Lang::En => "Cancelled. Use /create_bot whenever you want to try again.",
            Lang::He => "בוטל. שלחו /create_bot בכל שלב שתרצו לנסות שוב.",
        }
    }

    pub fn flow_already_in_progress(&self) -> &'static str {
        match self {
            Lang::En => "A bot is already being created from this request, please wait.",
            Lang::He => "בוט כבר נמצא בתהליך יצירה מהבקשה הזו, המתינו בבקשה.",
        }
    }

    pub fn flow_rate_limited(&self) -> &'static str {
        match self {
            Lang::En => "You've reached the limit of 2 bots created per day. Please try again tomorrow.",
            Lang::He => "הגעתם למגבלה של 2 בוטים ביום. נסו שוב מחר.",
        }
    }

    pub fn flow_no_active_flow(&self) -> &'static str {
        match self {
            Lang::En => "There's nothing to cancel right now.",
            Lang::He => "אין כרגע שום דבר לבטל.",
        }
    }
}

// =============================================================================
// Synthesis / provider error messages (C4 provider-error mapping table)
// =============================================================================

impl Lang {
    pub fn error_system_busy(&self) -> &'static str {
        match self {
            Lang::En => "⚠️ The system is busy right now. Please try again in a few minutes.",
            Lang::He => "⚠️ המערכת עמוסה כרגע. נסו שוב בעוד כמה דקות.",
        }
    }

    pub fn error_auth(&self) -> &'static str {
        match self {
            Lang::En => "⚠️ Could not reach the code generation service. Please try again later.",
            Lang::He => "⚠️ לא ניתן היה להגיע לשירות יצירת הקוד. נסו שוב מאוחר יותר.",
        }
    }

    pub fn error_service_unavailable(&self) -> &'static str {
        match self {
            Lang::En => "⚠️ The code generation service is currently unavailable. Please try again later.",
            Lang::He => "⚠️ שירות יצירת הקוד אינו זמין כרגע. נסו שוב מאוחר יותר.",
        }
    }

    pub fn error_model_no_code(&self) -> &'static str {
        match self {
            Lang::En => "⚠️ The model didn't return any code. Please try describing your bot differently.",
            Lang::He => "⚠️ המודל לא החזיר קוד. נסו לתאר את הבוט בצורה אחרת.",
        }
    }

    pub fn error_plugin_rejected(&self, reason: &str) -> String {
        match self {
            Lang::En => format!("⚠️ The generated code was rejected by a safety check ({reason}). Please try a different description."),
            Lang::He => format!("⚠️ הקוד שנוצר נדחה על ידי בדיקת בטיחות ({reason}). נסו תיאור אחר."),
        }
    }

    pub fn error_generic_creation_failed(&self) -> &'static str {
        match self {
            Lang::En => "❌ Something went wrong while creating your bot. Please try again.",
            Lang::He => "❌ משהו השתבש ביצירת הבוט. נסו שוב.",
        }
    }
}

// =============================================================================
// Dispatcher / handler runtime messages
// =============================================================================

impl Lang {
    /// Fixed apology reply sent when a loaded handler raises.
    pub fn handler_fault_apology(&self) -> &'static str {
        match self {
            Lang::En => "Sorry, something went wrong. Please try again.",
            Lang::He => "מצטערים, משהו השתבש. נסו שוב.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_code_maps_hebrew_variants() {
        assert_eq!(Lang::from_code(Some("he")), Lang::He);
        assert_eq!(Lang::from_code(Some("iw")), Lang::He);
        assert_eq!(Lang::from_code(Some("fr")), Lang::En);
        assert_eq!(Lang::from_code(None), Lang::En);
    }

    #[test]
    fn every_prompt_has_both_variants_nonempty() {
        for lang in [Lang::En, Lang::He] {
            assert!(!lang.flow_start().is_empty());
            assert!(!lang.flow_waiting_token().is_empty());
            assert!(!lang.handler_fault_apology().is_empty());
        }
    }
}
