//! 产物提取集成测试（两种模式）

use bolt::extract::{extract_artifacts, extract_runnable};
use bolt::ErrorKind;

#[test]
fn test_artifacts_in_stream_order_with_exact_content() {
    let text = "Here is the site.\n\
```index.html\n<html>\n\n<body></body>\n</html>\n```\n\
Some styles:\n\
```style.css\nbody { margin: 0; }\n```\n\
```js\nconsole.log('not a file');\n```\n\
```app.js\nlet x = 1;\n\nx += 1;\n```\nEnjoy!";

    let artifacts = extract_artifacts(text, 3);
    let names: Vec<_> = artifacts.iter().map(|a| a.filename.as_str()).collect();
    assert_eq!(names, vec!["index.html", "style.css", "app.js"]);
    assert_eq!(artifacts[0].content, "<html>\n\n<body></body>\n</html>\n");
    assert_eq!(artifacts[2].content, "let x = 1;\n\nx += 1;\n");
    assert!(artifacts.iter().all(|a| a.turn == 3));
    assert!(artifacts.iter().all(|a| !a.content.contains("```")));
}

#[test]
fn test_unterminated_trailing_fence_is_dropped() {
    let text = "```a.html\n<p>a</p>\n```\n```b.css\np { color: red; }\n```\n```c.js\nlet half = ";
    let artifacts = extract_artifacts(text, 1);
    assert_eq!(artifacts.len(), 2);
    assert_eq!(artifacts[1].filename, "b.css");
}

#[test]
fn test_app_html_example() {
    let artifacts = extract_artifacts("```app.html\n<html>...\n```", 1);
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].filename, "app.html");
    assert_eq!(artifacts[0].content, "<html>...\n");
}

#[test]
fn test_runnable_snippet_modes() {
    assert_eq!(
        extract_runnable("Sure:\n```python\nprint('hi')\n```\nand\n```python\nprint(2)\n```").unwrap(),
        "print('hi')\n"
    );
    // 没有围栏时整段回复即代码
    assert_eq!(extract_runnable("  print(1)\n").unwrap(), "print(1)");

    let err = extract_runnable("```python\nprint(1)").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExtractionAmbiguity);
}
