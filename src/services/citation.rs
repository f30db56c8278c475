//! 引用格式化
//!
//! 把正文中的 `[n]` 标记转换成指向第 n 个来源的 markdown 链接

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::models::Source;

static MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"( ?)\[(\d+)\](\()?").expect("citation marker regex"));

/// 格式化引用，返回 (新内容, 实际引用的不同来源数)
///
/// 已经是链接形式的 `[n](...)` 保持不变；编号超出来源范围的标记会被删除。
/// 对结果重复调用得到相同输出。
pub fn format_citations(content: &str, sources: &[Source]) -> (String, usize) {
    let mut cited = BTreeSet::new();
    let formatted = MARKER.replace_all(content, |caps: &Captures| {
        let space = &caps[1];
        let number: usize = caps[2].parse().unwrap_or(0);
        let already_linked = caps.get(3).is_some();

        match sources.get(number.wrapping_sub(1)) {
            Some(source) if number > 0 => {
                cited.insert(number);
                if already_linked {
                    caps[0].to_string()
                } else {
                    format!("{}[{}]({})", space, number, source.url)
                }
            }
            _ if already_linked => caps[0].to_string(),
            _ => String::new(),
        }
    });
    (formatted.into_owned(), cited.len())
}
