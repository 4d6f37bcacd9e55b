//! BIP21-style payment URIs for donation checkouts.

use bitcoin::{Address, Amount, Denomination};

use urlencoding::encode;

/// Build a `bitcoin:` URI for the given address and amount, with optional
/// label and message query parameters. The amount is rendered in decimal
/// BTC, as wallets expect.
pub fn payment_uri(
    address: &Address,
    amount: Amount,
    label: Option<&str>,
    message: Option<&str>,
) -> String {
    let mut uri = format!(
        "bitcoin:{}?amount={}",
        address,
        amount.to_string_in(Denomination::Bitcoin)
    );
    if let Some(label) = label {
        uri.push_str(&format!("&label={}", encode(label)));
    }
    if let Some(message) = message {
        uri.push_str(&format!("&message={}", encode(message)));
    }
    uri
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::str::FromStr;

    fn addr() -> Address {
        Address::from_str("bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu")
            .unwrap()
            .assume_checked()
    }

    #[test]
    fn uri_with_amount_only() {
        let uri = payment_uri(&addr(), Amount::from_sat(222_222), None, None);
        assert_eq!(
            uri,
            "bitcoin:bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu?amount=0.00222222"
        );
    }

    #[test]
    fn uri_with_label_and_message() {
        let uri = payment_uri(
            &addr(),
            Amount::from_sat(123_456_789),
            Some("satoshi"),
            Some("keep building!"),
        );
        assert_eq!(
            uri,
            "bitcoin:bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu?amount=1.23456789\
             &label=satoshi&message=keep%20building%21"
        );
    }
}
