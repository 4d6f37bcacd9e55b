use bitcoin::{address, Address, Amount, Denomination};

use serde::{de, Deserialize, Deserializer, Serializer};

/// Deserialize an address from string, assuming the network was checked.
pub fn deser_addr_assume_checked<'de, D>(deserializer: D) -> Result<Address, D::Error>
where
    D: Deserializer<'de>,
{
    let addr = Address::<address::NetworkUnchecked>::deserialize(deserializer)?;
    Ok(addr.assume_checked())
}

/// Serialize an amount as decimal BTC, keeping the full satoshi precision.
pub fn ser_amount<S: Serializer>(amount: &Amount, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&amount.to_string_in(Denomination::Bitcoin))
}

/// Deserialize an amount from a decimal BTC string.
pub fn deser_amount_from_btc<'de, D>(deserializer: D) -> Result<Amount, D::Error>
where
    D: Deserializer<'de>,
{
    let btc: String = String::deserialize(deserializer)?;
    Amount::from_str_in(&btc, Denomination::Bitcoin).map_err(de::Error::custom)
}
