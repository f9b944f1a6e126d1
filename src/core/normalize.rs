//! 路径规范化
//!
//! 复刻迁移工具的字符替换改名规则，用于精确匹配失败后的模糊回退。
//! 规范相对路径的推导也在这里。

/// 迁移工具会替换为单个下划线的字符集
const SUBSTITUTED_CHARS: &[char] = &[
    '"', '*', ':', '<', '>', '?', '\\', '&', '#', '%', '{', '}', '~',
];

/// 把相对路径映射为迁移工具改名后的形态。纯函数，永不失败。
///
/// 空格变成三字符的 `_20`（工具先把空格编码为 `%20`，再把 `%` 改写为 `_`）；
/// 其余特殊字符各变成一个 `_`；`/` 和 `.` 保持不变。
/// 之后循环把 `..` 替换为 `_.`，直到不再出现 `..` 为止——
/// 替换本身会制造新的相邻点对，单趟替换不够
pub fn normalize(path: &str) -> String {
    let mut output = String::with_capacity(path.len());

    for ch in path.chars() {
        if ch == ' ' {
            output.push_str("_20");
        } else if SUBSTITUTED_CHARS.contains(&ch) {
            output.push('_');
        } else {
            output.push(ch);
        }
    }

    while output.contains("..") {
        output = output.replace("..", "_.");
    }

    output
}

/// 从服务器相对路径推导库根相对的规范路径。
/// 前缀比较不区分大小写；路径不在库根下时退回原始路径（去掉前导斜杠）
pub fn canonical_relative_path(server_relative: &str, library_root: &str) -> String {
    let root = library_root.trim_end_matches('/');

    if !root.is_empty() {
        if let Some(prefix) = server_relative.get(..root.len()) {
            if prefix.eq_ignore_ascii_case(root) {
                return server_relative[root.len()..]
                    .trim_start_matches('/')
                    .to_string();
            }
        }
    }

    server_relative.trim_start_matches('/').to_string()
}
