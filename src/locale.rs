//! UI text and system prompts for each supported language.
//!
//! Static text lives in per-language tables; placeholders use minijinja
//! syntax (`{{ error }}`). System prompts are minijinja templates compiled
//! into the binary from `prompts/<lang>/`, with an NSFW switch.

use minijinja::{context, Environment};
use serde::Serialize;
use std::str::FromStr;
use tracing::warn;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Zh,
    En,
}

impl Language {
    pub fn code(&self) -> &'static str {
        match self {
            Language::Zh => "zh",
            Language::En => "en",
        }
    }
}

impl FromStr for Language {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zh" | "zh-cn" | "cn" => Ok(Language::Zh),
            "en" | "en-us" | "en-gb" => Ok(Language::En),
            other => Err(Error::Config(format!("unsupported language: {other}"))),
        }
    }
}

const ZH_TEXT: &[(&str, &str)] = &[
    ("APP_STARTING", "Easy-Prompt 正在启动……"),
    ("APP_SHUTDOWN", "会话结束，感谢使用 Easy-Prompt！"),
    ("EXITING", "正在退出……"),
    ("EASYPROMPT_INITIALIZED", "Easy-Prompt 已就绪"),
    ("AI_PROMPT", "AI: "),
    ("YOU_PROMPT", "你: "),
    ("CONTINUE_PROMPT", "好的，我们继续完善这个角色。还有什么想补充的吗？"),
    ("CONFIRM_GENERATION_PROMPT", "角色档案已经足够完整，是否现在生成最终提示词？(y/n) "),
    ("FINAL_PROMPT_HEADER", "===== 最终角色提示词 ====="),
    ("EVALUATOR_EVALUATING", "[评估服务] 正在评估角色档案……"),
    ("EVALUATOR_DONE", "[评估完成] {{ critique }}"),
    ("EVALUATOR_EMPTY_PROFILE", "[评估服务] 档案为空"),
    ("EVALUATOR_SERVICE_START", "评估服务已启动（并发数 {{ concurrency }}）"),
    ("EVALUATOR_SERVICE_STOP", "评估服务已停止"),
    ("ERROR_LLM_NOT_CONFIGURED", "错误：LLM 尚未配置，请先提供 API 配置。"),
    ("ERROR_CONVERSATION_LLM", "对话模型出错：{{ error }}"),
    ("ERROR_EVALUATOR_LLM", "评估模型出错：{{ error }}"),
    ("ERROR_WRITER_LLM", "写作模型出错：{{ error }}"),
    ("NSFW_MODE_ACTIVE_WARNING_HEADER", "警告：R18 模式已开启"),
    ("NSFW_MODE_ACTIVE_WARNING_FILTERS", "所有内容安全过滤已关闭"),
    ("NSFW_MODE_ACTIVE_WARNING_CONTENT", "生成内容可能包含成人主题"),
    ("API_CONFIGURED", "API 已配置: {{ api_type }}"),
    ("API_RECONFIGURED", "API 已重新配置: {{ api_type }}"),
    ("API_CONFIG_FAILED", "API 配置失败，请检查配置参数：{{ error }}"),
    ("DEFAULT_API_FAILED", "默认 API 初始化失败：{{ error }}"),
    ("DEFAULT_CRITIQUE", "角色档案为空，请引导用户描述角色的核心身份。"),
    ("READY_DEFAULT_REASON", "角色档案似乎已足够完整。"),
    ("SESSION_NAME", "会话 {{ timestamp }}"),
    ("SESSION_RESUMED", "已恢复会话：{{ name }}"),
    ("SESSION_NOT_FOUND", "会话不存在：{{ id }}"),
    ("WELCOME", "欢迎使用 Easy-Prompt，请通过 WebSocket 连接 /ws/prompt"),
    ("INITIAL_USER_PROMPT", "你好！请向我打个招呼，并邀请我开始描述我想创建的角色。"),
    ("TURN_ENVELOPE", "诊断报告: {{ critique }}\n\n---\n\n用户: {{ message }}"),
];

const EN_TEXT: &[(&str, &str)] = &[
    ("APP_STARTING", "Easy-Prompt is starting..."),
    ("APP_SHUTDOWN", "Session finished, thanks for using Easy-Prompt!"),
    ("EXITING", "Exiting..."),
    ("EASYPROMPT_INITIALIZED", "Easy-Prompt is ready"),
    ("AI_PROMPT", "AI: "),
    ("YOU_PROMPT", "You: "),
    ("CONTINUE_PROMPT", "Alright, let's keep refining the character. Anything else you'd like to add?"),
    ("CONFIRM_GENERATION_PROMPT", "The character profile looks complete. Generate the final prompt now? (y/n) "),
    ("FINAL_PROMPT_HEADER", "===== Final Character Prompt ====="),
    ("EVALUATOR_EVALUATING", "[Evaluator] Evaluating the character profile..."),
    ("EVALUATOR_DONE", "[Evaluation complete] {{ critique }}"),
    ("EVALUATOR_EMPTY_PROFILE", "[Evaluator] The profile is empty"),
    ("EVALUATOR_SERVICE_START", "Evaluator service started (concurrency {{ concurrency }})"),
    ("EVALUATOR_SERVICE_STOP", "Evaluator service stopped"),
    ("ERROR_LLM_NOT_CONFIGURED", "Error: the LLM is not configured. Please send an API configuration first."),
    ("ERROR_CONVERSATION_LLM", "Conversation model error: {{ error }}"),
    ("ERROR_EVALUATOR_LLM", "Evaluator model error: {{ error }}"),
    ("ERROR_WRITER_LLM", "Writer model error: {{ error }}"),
    ("NSFW_MODE_ACTIVE_WARNING_HEADER", "WARNING: NSFW MODE IS ACTIVE"),
    ("NSFW_MODE_ACTIVE_WARNING_FILTERS", "All content safety filters are disabled"),
    ("NSFW_MODE_ACTIVE_WARNING_CONTENT", "Generated content may include adult themes"),
    ("API_CONFIGURED", "API configured: {{ api_type }}"),
    ("API_RECONFIGURED", "API reconfigured: {{ api_type }}"),
    ("API_CONFIG_FAILED", "API configuration failed, please check the parameters: {{ error }}"),
    ("DEFAULT_API_FAILED", "Default API initialisation failed: {{ error }}"),
    ("DEFAULT_CRITIQUE", "The profile is empty. Guide the user to describe the character's core identity."),
    ("READY_DEFAULT_REASON", "The character profile looks complete enough."),
    ("SESSION_NAME", "Session {{ timestamp }}"),
    ("SESSION_RESUMED", "Resumed session: {{ name }}"),
    ("SESSION_NOT_FOUND", "Session not found: {{ id }}"),
    ("WELCOME", "Welcome to Easy-Prompt. Connect via WebSocket at /ws/prompt"),
    ("INITIAL_USER_PROMPT", "Hi! Please greet me and invite me to start describing the character I want to create."),
    ("TURN_ENVELOPE", "Diagnostic report: {{ critique }}\n\n---\n\nUser: {{ message }}"),
];

#[derive(Debug, Clone, Copy)]
pub enum SystemPrompt {
    Conversation,
    Evaluator,
    Writer,
}

impl SystemPrompt {
    fn name(&self) -> &'static str {
        match self {
            SystemPrompt::Conversation => "conversation",
            SystemPrompt::Evaluator => "evaluator",
            SystemPrompt::Writer => "writer",
        }
    }
}

pub struct Locale {
    language: Language,
    env: Environment<'static>,
}

impl Locale {
    pub fn new(language: Language) -> Self {
        let mut env = Environment::new();
        // Sources are static and covered by tests, so registration cannot fail at runtime
        let templates: [(&str, &'static str); 3] = match language {
            Language::Zh => [
                ("conversation", include_str!("../prompts/zh/conversation.j2")),
                ("evaluator", include_str!("../prompts/zh/evaluator.j2")),
                ("writer", include_str!("../prompts/zh/writer.j2")),
            ],
            Language::En => [
                ("conversation", include_str!("../prompts/en/conversation.j2")),
                ("evaluator", include_str!("../prompts/en/evaluator.j2")),
                ("writer", include_str!("../prompts/en/writer.j2")),
            ],
        };
        for (name, source) in templates {
            if let Err(e) = env.add_template(name, source) {
                warn!(template = name, error = %e, "Failed to register prompt template");
            }
        }
        Self { language, env }
    }

    pub fn language(&self) -> Language {
        self.language
    }

    fn table(&self) -> &'static [(&'static str, &'static str)] {
        match self.language {
            Language::Zh => ZH_TEXT,
            Language::En => EN_TEXT,
        }
    }

    /// Static text for `key`, or the key itself when it is unknown.
    pub fn t(&self, key: &str) -> String {
        self.table()
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.to_string())
            .unwrap_or_else(|| key.to_string())
    }

    /// Static text for `key` with its placeholders filled from `ctx`.
    pub fn t_with<S: Serialize>(&self, key: &str, ctx: S) -> String {
        let source = self.t(key);
        match self.env.render_str(&source, ctx) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(key, error = %e, "Failed to render locale text");
                source
            }
        }
    }

    pub fn system_prompt(&self, prompt: SystemPrompt, nsfw: bool) -> Result<String> {
        let rendered = self
            .env
            .get_template(prompt.name())?
            .render(context! { nsfw => nsfw })?;
        Ok(rendered.trim().to_string())
    }

    /// Wraps a user message with the latest evaluator critique for the conversation model.
    pub fn turn_envelope(&self, critique: &str, message: &str) -> String {
        self.t_with("TURN_ENVELOPE", context! { critique => critique, message => message })
    }
}
