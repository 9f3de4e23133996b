use crate::db::PersistenceGateway;
use crate::telegram::{Reply, TelegramApiClient};
use rhai::{Dynamic, Engine, Scope, AST};
use std::sync::Arc;

/// Capability descriptor (§4.9, §9 Design Notes): computed once when a
/// handler is loaded by inspecting its function table, never by runtime
/// arity-probing on every call.
#[derive(Clone, Debug, Default)]
pub struct CapabilityDescriptor {
    pub has_get_widget: bool,
    /// Parameter count accepted by `handle_message`, richest first preference
    /// resolved at load time: 3 = (text, user_id, context), 2 = (text, user_id), 1 = (text).
    pub handle_message_arity: Option<usize>,
    pub has_handle_callback: bool,
}

impl CapabilityDescriptor {
    fn from_ast(ast: &AST) -> Self {
        let mut desc = CapabilityDescriptor::default();
        for func in ast.iter_functions() {
            match func.name {
                "get_widget" => desc.has_get_widget = true,
                "handle_message" => desc.handle_message_arity = Some(func.params.len()),
                "handle_callback" => desc.has_handle_callback = true,
                _ => {}
            }
        }
        desc
    }
}

/// A loaded, quarantine-eligible handler: compiled script plus the
/// capability descriptor read once at load time.
pub struct LoadedHandler {
    pub handler_name: String,
    pub ast: AST,
    pub capabilities: CapabilityDescriptor,
    engine: Engine,
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerLoadError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("capability probe failed: {0}")]
    Probe(String),
}

/// Read-only fields and callable moderation capabilities exposed to a
/// generated script as the `context` argument to `handle_message` (§6,
/// MessageContext shape). Registered as a Rhai custom type so scripts call
/// its methods directly, with no textual preamble injection (§9).
#[derive(Clone)]
pub struct HandlerContext {
    pub bot_token: String,
    pub chat_id: i64,
    pub chat_type: String,
    pub chat_title: Option<String>,
    pub message_id: i64,
    pub user_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub is_group: bool,
    pub is_private: bool,
    pub sender_is_admin: bool,
    telegram: Arc<TelegramApiClient>,
}

impl HandlerContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bot_token: String,
        chat_id: i64,
        chat_type: String,
        chat_title: Option<String>,
        message_id: i64,
        user_id: i64,
        username: Option<String>,
        first_name: Option<String>,
        last_name: Option<String>,
        is_group: bool,
        is_private: bool,
        sender_is_admin: bool,
        telegram: Arc<TelegramApiClient>,
    ) -> Self {
        Self {
            bot_token,
            chat_id,
            chat_type,
            chat_title,
            message_id,
            user_id,
            username,
            first_name,
            last_name,
            is_group,
            is_private,
            sender_is_admin,
            telegram,
        }
    }

    fn block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(fut))
    }

    fn reply(&mut self, text: String) {
        let _ = Self::block_on(self.telegram.send_message(&self.bot_token, self.chat_id, &Reply::Text(text)));
    }

    fn delete_message(&mut self) {
        let _ = Self::block_on(self.telegram.delete_message(&self.bot_token, self.chat_id, self.message_id));
    }

    fn ban_user(&mut self, user_id: i64) {
        let _ = Self::block_on(self.telegram.ban_user(&self.bot_token, self.chat_id, user_id));
    }

    fn kick_user(&mut self, user_id: i64) {
        let _ = Self::block_on(self.telegram.kick_user(&self.bot_token, self.chat_id, user_id));
    }

    fn mute_user(&mut self, user_id: i64) {
        let _ = Self::block_on(self.telegram.mute_user(&self.bot_token, self.chat_id, user_id));
    }

    fn unmute_user(&mut self, user_id: i64) {
        let _ = Self::block_on(self.telegram.unmute_user(&self.bot_token, self.chat_id, user_id));
    }

    fn is_admin(&mut self, user_id: i64) -> bool {
        Self::block_on(self.telegram.is_admin(&self.bot_token, self.chat_id, user_id)).unwrap_or(false)
    }

    fn get_bot_token(&mut self) -> String {
        self.bot_token.clone()
    }
    fn get_chat_id(&mut self) -> i64 {
        self.chat_id
    }
    fn get_chat_type(&mut self) -> String {
        self.chat_type.clone()
    }
    fn get_chat_title(&mut self) -> Dynamic {
        match &self.chat_title {
            Some(t) => t.clone().into(),
            None => Dynamic::UNIT,
        }
    }
    fn get_message_id(&mut self) -> i64 {
        self.message_id
    }
    fn get_user_id(&mut self) -> i64 {
        self.user_id
    }
    fn get_username(&mut self) -> Dynamic {
        match &self.username {
            Some(u) => u.clone().into(),
            None => Dynamic::UNIT,
        }
    }
    fn get_first_name(&mut self) -> Dynamic {
        match &self.first_name {
            Some(n) => n.clone().into(),
            None => Dynamic::UNIT,
        }
    }
    fn get_last_name(&mut self) -> Dynamic {
        match &self.last_name {
            Some(n) => n.clone().into(),
            None => Dynamic::UNIT,
        }
    }
    fn get_is_group(&mut self) -> bool {
        self.is_group
    }
    fn get_is_private(&mut self) -> bool {
        self.is_private
    }
    fn get_sender_is_admin(&mut self) -> bool {
        self.sender_is_admin
    }
}

/// Handler Runtime (C9): builds the embedded scripting engine a generated
/// handler executes in. `save_state`/`load_state` are native functions of
/// this engine, scoped by `handler_name`, backed by the `bot_states` table —
/// the exported-API replacement for the original's textual preamble
/// injection (§9 Design Notes).
pub struct HandlerRuntime {
    db: Arc<PersistenceGateway>,
}

impl HandlerRuntime {
    pub fn new(db: Arc<PersistenceGateway>) -> Self {
        Self { db }
    }

    fn build_engine(&self, handler_name: &str) -> Engine {
        let mut engine = Engine::new();
        engine.register_type_with_name::<HandlerContext>("HandlerContext");
        engine
            .register_fn("reply", HandlerContext::reply)
            .register_fn("delete_message", HandlerContext::delete_message)
            .register_fn("ban_user", HandlerContext::ban_user)
            .register_fn("kick_user", HandlerContext::kick_user)
            .register_fn("mute_user", HandlerContext::mute_user)
            .register_fn("unmute_user", HandlerContext::unmute_user)
            .register_fn("is_admin", HandlerContext::is_admin)
            .register_get("bot_token", HandlerContext::get_bot_token)
            .register_get("chat_id", HandlerContext::get_chat_id)
            .register_get("chat_type", HandlerContext::get_chat_type)
            .register_get("chat_title", HandlerContext::get_chat_title)
            .register_get("message_id", HandlerContext::get_message_id)
            .register_get("user_id", HandlerContext::get_user_id)
            .register_get("username", HandlerContext::get_username)
            .register_get("first_name", HandlerContext::get_first_name)
            .register_get("last_name", HandlerContext::get_last_name)
            .register_get("is_group", HandlerContext::get_is_group)
            .register_get("is_private", HandlerContext::get_is_private)
            .register_get("sender_is_admin", HandlerContext::get_sender_is_admin);

        let db = self.db.clone();
        let bot_id = handler_name.to_string();
        engine.register_fn("save_state", move |user_id: i64, key: String, value: Dynamic| {
            let json = dynamic_to_json(&value);
            let db = db.clone();
            let bot_id = bot_id.clone();
            tokio::task::block_in_place(|| {
                tokio::runtime::Handle::current().block_on(async move {
                    let _ = db.state_save(&bot_id, &user_id.to_string(), &key, &json).await;
                })
            });
        });

        let db = self.db.clone();
        let bot_id = handler_name.to_string();
        engine.register_fn(
            "load_state",
            move |user_id: i64, key: String, default: Dynamic| -> Dynamic {
                let db = db.clone();
                let bot_id = bot_id.clone();
                let result = tokio::task::block_in_place(|| {
                    tokio::runtime::Handle::current()
                        .block_on(async move { db.state_load(&bot_id, &user_id.to_string(), &key).await })
                });
                match result {
                    Ok(Some(json)) => json_to_dynamic(&json),
                    _ => default,
                }
            },
        );

        engine
    }

    /// Compiles handler source. A syntax error here is the load-time
    /// failure that triggers quarantine in the registry (§4.3).
    pub fn load(&self, handler_name: &str, source: &str) -> Result<LoadedHandler, HandlerLoadError> {
        let engine = self.build_engine(handler_name);
        let ast = engine
            .compile(source)
            .map_err(|e| HandlerLoadError::Parse(e.to_string()))?;
        let capabilities = CapabilityDescriptor::from_ast(&ast);
        Ok(LoadedHandler {
            handler_name: handler_name.to_string(),
            ast,
            capabilities,
            engine,
        })
    }
}

impl LoadedHandler {
    pub fn get_widget(&self) -> Option<Dynamic> {
        if !self.capabilities.has_get_widget {
            return None;
        }
        let mut scope = Scope::new();
        self.engine
            .call_fn::<Dynamic>(&mut scope, &self.ast, "get_widget", ())
            .ok()
    }

    /// Invokes `handle_message` with the richest accepted signature
    /// determined by the capability descriptor, never by runtime probing.
    pub fn handle_message(
        &self,
        text: &str,
        user_id: i64,
        context: HandlerContext,
    ) -> Result<Option<Dynamic>, String> {
        let mut scope = Scope::new();
        let result = match self.capabilities.handle_message_arity {
            Some(3) => self
                .engine
                .call_fn::<Dynamic>(&mut scope, &self.ast, "handle_message", (text.to_string(), user_id, context)),
            Some(2) => self
                .engine
                .call_fn::<Dynamic>(&mut scope, &self.ast, "handle_message", (text.to_string(), user_id)),
            Some(_) => self
                .engine
                .call_fn::<Dynamic>(&mut scope, &self.ast, "handle_message", (text.to_string(),)),
            None => return Ok(None),
        };
        match result {
            Ok(v) if v.is_unit() => Ok(None),
            Ok(v) => Ok(Some(v)),
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn handle_callback(&self, data: &str, user_id: i64) -> Result<Option<Dynamic>, String> {
        if !self.capabilities.has_handle_callback {
            return Ok(None);
        }
        let mut scope = Scope::new();
        match self
            .engine
            .call_fn::<Dynamic>(&mut scope, &self.ast, "handle_callback", (data.to_string(), user_id))
        {
            Ok(v) if v.is_unit() => Ok(None),
            Ok(v) => Ok(Some(v)),
            Err(e) => Err(e.to_string()),
        }
    }
}

fn dynamic_to_json(value: &Dynamic) -> serde_json::Value {
    rhai::serde::from_dynamic(value).unwrap_or(serde_json::Value::Null)
}

fn json_to_dynamic(value: &serde_json::Value) -> Dynamic {
    rhai::serde::to_dynamic(value.clone()).unwrap_or(Dynamic::UNIT)
}
