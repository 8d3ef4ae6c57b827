//! 字元編碼模組
//!
//! 伺服器可能使用 UTF-8 以外的編碼（例如 Big5）。
//! 收到的每一行都會被轉為合法的 UTF-8，無效位元組以 U+FFFD 取代。

use encoding_rs::{Encoding, UTF_8};

/// 依標籤取得編碼（如 `utf-8`、`big5`），未知標籤回傳 `None`
pub fn resolve(label: &str) -> Option<&'static Encoding> {
    Encoding::for_label(label.trim().as_bytes())
}

/// 將一行位元組解碼為 UTF-8 字串
///
/// # Example
/// ```
/// use mucore::encoding::decode_line;
///
/// let big5_bytes = [0xa7, 0x41, 0xa6, 0x6e]; // "你好" in Big5
/// let text = decode_line(&big5_bytes, encoding_rs::BIG5);
/// assert_eq!(text, "你好");
/// ```
pub fn decode_line(bytes: &[u8], encoding: &'static Encoding) -> String {
    let (decoded, _) = encoding.decode_without_bom_handling(bytes);
    decoded.into_owned()
}

/// 將 UTF-8 字串編碼為伺服器使用的位元組
pub fn encode_line(text: &str, encoding: &'static Encoding) -> Vec<u8> {
    if encoding == UTF_8 {
        return text.as_bytes().to_vec();
    }
    let (encoded, _, _) = encoding.encode(text);
    encoded.into_owned()
}
