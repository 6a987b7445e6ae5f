//! 各模式的系统指令与用户消息模板

use crate::execution::Language;
use crate::memory::{ConversationMemory, Message};

/// 流式模式（网页构建）：要求用带文件名的围栏输出文件
pub const WEB_SYSTEM_PROMPT: &str = r#"You are an expert web developer building apps for users. You create complete, working web applications.

HOW TO RESPOND:
1. First, briefly explain what you're going to build (1-2 sentences)
2. Then output the code files (these will be deployed automatically)
3. Finally, describe what was created and how to use it

CODING RULES:
- Generate complete HTML, CSS, and JavaScript files
- Use modern, responsive CSS (flexbox, grid)
- Use Tailwind CSS via CDN for quick styling
- Make designs visually appealing with good colors and spacing
- Ensure the app is fully functional

FILE OUTPUT FORMAT (required for deployment):
```index.html
<!DOCTYPE html>
<html>...</html>
```

```styles.css
/* styles */
```

```script.js
// code
```

RESPONSE STYLE:
- Keep explanations brief and friendly
- Don't explain the code in detail - users will see the live preview
- Focus on what the app does, not how it's coded
- Use bullet points for features"#;

/// 批处理模式的通用对话
pub const CHAT_SYSTEM_PROMPT: &str = r#"You are a helpful coding assistant. You can:
1. Generate code when asked
2. Explain code concepts
3. Help debug issues
4. Answer programming questions

When generating code, wrap it in triple backticks with the language identifier.
Be concise and helpful."#;

pub const EXPLAIN_SYSTEM_PROMPT: &str =
    "You are a helpful programming tutor. Explain code clearly and concisely.";

pub const WEB_TEMPERATURE: f32 = 0.5;
pub const GENERATE_TEMPERATURE: f32 = 0.3;
pub const FIX_TEMPERATURE: f32 = 0.2;
pub const CHAT_TEMPERATURE: f32 = 0.7;

/// 流式模式回放的历史轮数
pub const WEB_HISTORY_EXCHANGES: usize = 3;
/// 批处理对话回放的生成记录数
pub const CHAT_HISTORY_EXCHANGES: usize = 5;

/// 代码生成（批处理）
pub fn generate_system_prompt(language: Language) -> String {
    let lang = language.as_str();
    format!(
        r#"You are an expert {lang} programmer. Generate clean, working code based on the user's request.

IMPORTANT RULES:
1. Return ONLY the code, no explanations before or after
2. Include necessary imports
3. Make the code complete and executable
4. Use proper error handling where appropriate
5. If you need to show output, use print statements

Wrap your code in triple backticks with the language identifier:
```{lang}
# your code here
```"#
    )
}

/// 自动修复的系统指令
pub fn fix_system_prompt(language: Language) -> String {
    let lang = language.as_str();
    format!(
        r#"You are a {lang} debugging expert. Analyze the error and provide a corrected version of the code.

Return ONLY the fixed code wrapped in triple backticks:
```{lang}
# fixed code here
```"#
    )
}

/// 自动修复的用户消息：失败代码 + 错误输出
pub fn fix_user_message(language: Language, code: &str, error: &str) -> String {
    let lang = language.as_str();
    format!(
        "The following code produced an error:\n\n```{lang}\n{code}\n```\n\nError:\n{error}\n\nPlease fix the code."
    )
}

pub fn explain_user_message(language: Language, code: &str) -> String {
    let lang = language.as_str();
    format!("Explain this {lang} code:\n\n```{lang}\n{code}\n```")
}

/// 流式模式历史：user 原文 + assistant 的文件摘要
pub fn web_history(memory: &ConversationMemory) -> Vec<Message> {
    memory
        .recent_exchanges(WEB_HISTORY_EXCHANGES)
        .into_iter()
        .flat_map(|(user, assistant)| {
            [
                Message::user(user.text.clone()),
                Message::assistant(format!(
                    "I created the following files: {}",
                    assistant.files.join(", ")
                )),
            ]
        })
        .collect()
}

/// 批处理对话历史：最近几次生成的提示与代码
pub fn chat_history(memory: &ConversationMemory) -> Vec<Message> {
    memory
        .recent_exchanges(CHAT_HISTORY_EXCHANGES)
        .into_iter()
        .flat_map(|(user, assistant)| {
            [
                Message::user(format!("Generate code: {}", user.text)),
                Message::assistant(assistant.text.clone()),
            ]
        })
        .collect()
}
