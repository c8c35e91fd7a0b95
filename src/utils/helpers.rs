//! Helper functions

pub fn current_timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Shorten a wallet address for log lines: `0x1234…cdef`
pub fn short_wallet(wallet: &str) -> String {
    let chars: Vec<char> = wallet.chars().collect();
    if chars.len() <= 12 {
        return wallet.to_string();
    }
    let head: String = chars[..6].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}…{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_wallet() {
        assert_eq!(short_wallet("0xWallet"), "0xWallet");
        assert_eq!(
            short_wallet("0x52908400098527886E0F7030069857D2E4169EE7"),
            "0x5290…9EE7"
        );
    }

    #[test]
    fn test_timestamp_is_recent() {
        // 2020-01-01 in epoch millis
        assert!(current_timestamp_millis() > 1_577_836_800_000);
    }
}
