//! 产物提取：从一轮模型回复的完整文本中取出代码
//!
//! 两种语义按模式保留：
//! - 流式（网页构建）：只有开栏紧跟 `name.ext` 文件名的块才是产物，其余是普通片段；
//! - 批处理：第一个非空围栏块（不论文件名）就是可运行片段。
//!
//! 只在流结束后调用；未闭合的尾部围栏直接丢弃，不做猜测。

pub mod lexer;

use serde::Serialize;

use crate::core::BoltError;

pub use lexer::{parse_filename, scan, FencedBlock, Scan, KNOWN_EXTENSIONS};

/// 一个待部署的代码产物
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeArtifact {
    pub filename: String,
    pub content: String,
    /// 产生它的 assistant 轮次序号
    pub turn: usize,
}

/// 流式模式：按出现顺序返回所有带文件名的产物（纯函数）
pub fn extract_artifacts(text: &str, turn: usize) -> Vec<CodeArtifact> {
    let scan = lexer::scan(text);
    if scan.unterminated {
        tracing::debug!(turn, "discarding unterminated trailing fence");
    }
    scan.blocks
        .into_iter()
        .filter(|b| !b.content.trim().is_empty())
        .filter_map(|b| {
            b.filename.map(|filename| CodeArtifact {
                filename,
                content: b.content,
                turn,
            })
        })
        .collect()
}

/// 批处理模式：第一个非空围栏块作为可运行片段
///
/// 没有任何围栏时整段回复（去首尾空白）即代码；只有未闭合围栏时返回 ExtractionAmbiguity。
pub fn extract_runnable(text: &str) -> Result<String, BoltError> {
    let scan = lexer::scan(text);
    if let Some(block) = scan.blocks.iter().find(|b| !b.content.trim().is_empty()) {
        return Ok(block.content.clone());
    }
    if scan.unterminated {
        return Err(BoltError::ExtractionAmbiguity(
            "response ended inside an unterminated code fence".to_string(),
        ));
    }
    if !scan.blocks.is_empty() {
        return Err(BoltError::ExtractionAmbiguity(
            "response contains only empty code blocks".to_string(),
        ));
    }
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(BoltError::ExtractionAmbiguity("empty response".to_string()));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;

    #[test]
    fn test_single_artifact_example() {
        let text = "Here you go:\n```app.html\n<html>...\n```\nEnjoy!";
        let artifacts = extract_artifacts(text, 1);
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].filename, "app.html");
        assert_eq!(artifacts[0].content, "<html>...\n");
        assert_eq!(artifacts[0].turn, 1);
    }

    #[test]
    fn test_multiple_artifacts_in_order_with_blank_lines() {
        let text = "\
Building a counter.

```index.html
<!DOCTYPE html>

<html></html>
```

```python
print('not an artifact')
```

```styles.css
body { margin: 0; }


h1 { color: red; }
```

```script.js
const t = `template ${1}`;
console.log('```');
```
Done.";
        let artifacts = extract_artifacts(text, 3);
        let names: Vec<_> = artifacts.iter().map(|a| a.filename.as_str()).collect();
        assert_eq!(names, vec!["index.html", "styles.css", "script.js"]);
        assert_eq!(artifacts[0].content, "<!DOCTYPE html>\n\n<html></html>\n");
        assert_eq!(artifacts[1].content, "body { margin: 0; }\n\n\nh1 { color: red; }\n");
        assert_eq!(
            artifacts[2].content,
            "const t = `template ${1}`;\nconsole.log('```');\n"
        );
    }

    #[test]
    fn test_unterminated_trailing_fence_is_discarded() {
        let text = "```a.html\n<p>a</p>\n```\n```b.css\np { color: blue; }\n";
        let artifacts = extract_artifacts(text, 0);
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].filename, "a.html");
    }

    #[test]
    fn test_whitespace_only_artifact_discarded() {
        let text = "```empty.js\n   \n\n```\n```ok.js\nx()\n```\n";
        let artifacts = extract_artifacts(text, 0);
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].filename, "ok.js");
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let text = "```a.js\n1\n```\n```b.js\n2\n```\n";
        assert_eq!(extract_artifacts(text, 0), extract_artifacts(text, 0));
    }

    #[test]
    fn test_runnable_takes_first_block_regardless_of_filename() {
        let text = "```python\nprint(1)\n```\n```index.html\n<p/>\n```\n";
        assert_eq!(extract_runnable(text).unwrap(), "print(1)\n");
    }

    #[test]
    fn test_runnable_without_fence_uses_whole_text() {
        assert_eq!(extract_runnable("  print(2)\n").unwrap(), "print(2)");
    }

    #[test]
    fn test_runnable_unterminated_is_ambiguous() {
        let err = extract_runnable("```python\nprint(1)\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExtractionAmbiguity);
    }
}
