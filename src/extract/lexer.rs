//! 代码围栏词法分析
//!
//! 按行扫描的小状态机：`Normal → AwaitFilename → InFence → Normal`。
//! 围栏内的反引号一律是字面内容，只有「整行只有 ≥ 开栏数量的反引号」才会闭合。
//! 输入结束时仍处于 InFence 的块记为 unterminated，由调用方丢弃。

use std::sync::OnceLock;

use regex::Regex;

/// 允许作为产物的扩展名
pub const KNOWN_EXTENSIONS: &[&str] = &[
    "html", "htm", "css", "js", "mjs", "json", "svg", "txt", "md", "py", "ts",
];

/// 一个已闭合的围栏代码块
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FencedBlock {
    /// 开栏后的信息串（去掉首尾空白）
    pub info: String,
    /// 信息串是合法文件名时的文件名
    pub filename: Option<String>,
    /// 块内原始内容（保留内部空行与每行换行符）
    pub content: String,
}

/// 扫描结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scan {
    pub blocks: Vec<FencedBlock>,
    /// 输入在围栏内部结束
    pub unterminated: bool,
}

#[derive(Debug)]
enum State {
    Normal,
    AwaitFilename { ticks: usize, info: String },
    InFence {
        ticks: usize,
        info: String,
        filename: Option<String>,
        body: String,
    },
}

fn filename_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let exts = KNOWN_EXTENSIONS.join("|");
        Regex::new(&format!(r"(?i)^[A-Za-z0-9_\-][A-Za-z0-9_\-./]*\.({exts})$"))
            .expect("static filename pattern")
    })
}

/// 判断信息串是否为 `name.ext` 形式的文件名；拒绝绝对路径与 `..`
pub fn parse_filename(info: &str) -> Option<String> {
    if info.is_empty() || info.starts_with(char::is_whitespace) {
        return None;
    }
    let token = info.split_whitespace().next()?;
    if !filename_re().is_match(token) {
        return None;
    }
    if token.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        return None;
    }
    Some(token.to_string())
}

/// 去掉至多 3 个前导空格
fn strip_indent(line: &str) -> Option<&str> {
    let indent = line.len() - line.trim_start_matches(' ').len();
    if indent > 3 {
        None
    } else {
        Some(&line[indent..])
    }
}

/// 开栏：≥3 个反引号，信息串不含反引号
fn opening_fence(line: &str) -> Option<(usize, &str)> {
    let rest = strip_indent(line)?;
    let ticks = rest.len() - rest.trim_start_matches('`').len();
    if ticks < 3 {
        return None;
    }
    let info = rest[ticks..].trim_end_matches(['\n', '\r']);
    if info.contains('`') {
        return None;
    }
    Some((ticks, info))
}

/// 闭栏：整行只有反引号且数量不少于开栏
fn closes_fence(line: &str, ticks: usize) -> bool {
    let Some(rest) = strip_indent(line) else {
        return false;
    };
    let rest = rest.trim_end();
    !rest.is_empty() && rest.chars().all(|c| c == '`') && rest.len() >= ticks
}

/// 围栏内的一行：闭栏则产出块，否则并入内容
fn fence_line(
    out: &mut Scan,
    line: &str,
    ticks: usize,
    info: String,
    filename: Option<String>,
    mut body: String,
) -> State {
    if closes_fence(line, ticks) {
        out.blocks.push(FencedBlock {
            info: info.trim().to_string(),
            filename,
            content: body,
        });
        return State::Normal;
    }
    body.push_str(line);
    State::InFence {
        ticks,
        info,
        filename,
        body,
    }
}

/// 扫描完整文本（纯函数）
pub fn scan(text: &str) -> Scan {
    let mut out = Scan::default();
    let mut state = State::Normal;

    for line in text.split_inclusive('\n') {
        state = match state {
            State::Normal => match opening_fence(line) {
                Some((ticks, info)) => State::AwaitFilename {
                    ticks,
                    info: info.to_string(),
                },
                None => State::Normal,
            },
            State::AwaitFilename { ticks, info } => {
                let filename = parse_filename(&info);
                fence_line(&mut out, line, ticks, info, filename, String::new())
            }
            State::InFence {
                ticks,
                info,
                filename,
                body,
            } => fence_line(&mut out, line, ticks, info, filename, body),
        };
    }

    out.unterminated = !matches!(state, State::Normal);
    out
}
