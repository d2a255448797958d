use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gai_core::ContextDocument;
use gai_error::{GaiError, Result};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument};

pub const CURRENCY_TOOL: &str = "CurrencyConversionTool";

/// 实时汇率来源
#[async_trait]
pub trait ExchangeRates: Send + Sync {
    /// 1 单位 from 折合多少 to；未知币种对返回 None
    async fn latest_rate(&self, from: &str, to: &str) -> Result<Option<f64>>;
}

/// hexarate.paikama.co 汇率接口
pub struct HexarateClient {
    http: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct HexarateResponse {
    #[serde(default)]
    data: Option<HexarateData>,
}

#[derive(Debug, Deserialize)]
struct HexarateData {
    #[serde(default)]
    mid: Option<f64>,
}

impl HexarateClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| GaiError::Configuration {
                key: "exchange_rates.base_url".to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ExchangeRates for HexarateClient {
    #[instrument(skip(self))]
    async fn latest_rate(&self, from: &str, to: &str) -> Result<Option<f64>> {
        let url = format!("{}/api/rates/latest/{}", self.base_url, from);
        let resp = self
            .http
            .get(url)
            .query(&[("target", to)])
            .send()
            .await
            .map_err(|e| GaiError::Network {
                operation: "exchange_rate".to_string(),
                message: e.to_string(),
            })?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            debug!(%from, %to, "exchange rate pair not found");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(GaiError::ServiceUnavailable {
                service: format!("exchange-rates (status {})", status),
            });
        }

        let parsed: HexarateResponse = resp.json().await.map_err(|e| GaiError::Serialization {
            format: "json".to_string(),
            message: e.to_string(),
        })?;
        Ok(parsed.data.and_then(|d| d.mid))
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AmountArg {
    Number(f64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct RawCurrencyArgs {
    #[serde(default, alias = "currencyFrom")]
    from: Option<String>,
    #[serde(default, alias = "currencyTo")]
    to: Option<String>,
    #[serde(default)]
    amount: Option<AmountArg>,
}

/// 校验后的换算参数：币种为大写三字母代码
#[derive(Debug, Clone, PartialEq)]
pub struct CurrencyArgs {
    pub from: String,
    pub to: String,
    pub amount: f64,
}

fn invalid(reason: impl Into<String>) -> GaiError {
    GaiError::Validation {
        message: reason.into(),
    }
}

fn currency_code(field: &str, value: Option<String>) -> Result<String> {
    let code = value
        .map(|v| v.trim().to_uppercase())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| invalid(format!("missing required argument '{}'", field)))?;
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(invalid(format!(
            "'{}' must be a 3-letter currency code, got '{}'",
            field, code
        )));
    }
    Ok(code)
}

impl CurrencyArgs {
    pub fn parse(args: &Value) -> Result<Self> {
        let raw: RawCurrencyArgs = serde_json::from_value(args.clone())
            .map_err(|e| invalid(format!("arguments do not match the schema: {}", e)))?;

        let amount = match raw.amount {
            None => 1.0,
            Some(AmountArg::Number(n)) => n,
            Some(AmountArg::Text(s)) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| invalid(format!("amount '{}' is not a number", s)))?,
        };
        if !amount.is_finite() || amount < 0.0 {
            return Err(invalid(format!("amount must be a non-negative number, got {}", amount)));
        }

        Ok(Self {
            from: currency_code("from", raw.from)?,
            to: currency_code("to", raw.to)?,
            amount,
        })
    }
}

/// 整数金额不带小数点输出
fn format_amount(amount: f64) -> String {
    if amount.fract() == 0.0 && amount.abs() < 1e15 {
        format!("{:.0}", amount)
    } else {
        amount.to_string()
    }
}

/// 货币换算工具
#[derive(Clone)]
pub struct CurrencyConverter {
    rates: Arc<dyn ExchangeRates>,
}

impl CurrencyConverter {
    pub fn new(rates: Arc<dyn ExchangeRates>) -> Self {
        Self { rates }
    }

    pub fn description() -> &'static str {
        "Converts an amount from one currency to another using today's exchange rate. \
Use it whenever the user asks to convert money or asks for an exchange rate."
    }

    pub fn parameters() -> Value {
        json!({
            "type": "object",
            "properties": {
                "from": {"type": "string", "description": "ISO 4217 code of the source currency, e.g. USD"},
                "to": {"type": "string", "description": "ISO 4217 code of the target currency, e.g. EUR"},
                "amount": {"type": "number", "description": "Amount to convert, defaults to 1"}
            },
            "required": ["from", "to"]
        })
    }

    pub async fn convert(&self, args: &CurrencyArgs) -> Result<String> {
        let rate = self
            .rates
            .latest_rate(&args.from, &args.to)
            .await
            .map_err(|e| GaiError::ToolFailure {
                tool: CURRENCY_TOOL.to_string(),
                message: e.to_string(),
            })?;

        Ok(match rate {
            Some(rate) if rate > 0.0 => format!(
                "{} {} converts to {:.2} {} as of today",
                format_amount(args.amount),
                args.from,
                args.amount * rate,
                args.to
            ),
            _ => format!("No exchange rate found for {} to {}", args.from, args.to),
        })
    }

    pub async fn invoke(&self, args: &Value) -> Result<Vec<ContextDocument>> {
        let parsed = CurrencyArgs::parse(args)?;
        let text = self.convert(&parsed).await?;
        Ok(vec![ContextDocument::try_new(text, CURRENCY_TOOL)?
            .with_extra("from", Value::String(parsed.from))
            .with_extra("to", Value::String(parsed.to))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FixedRates;

    #[test]
    fn accepts_aliases_and_string_amounts() {
        let args = CurrencyArgs::parse(&json!({
            "currencyFrom": " usd ",
            "currencyTo": "eur",
            "amount": "100"
        }))
        .unwrap();
        assert_eq!(
            args,
            CurrencyArgs {
                from: "USD".into(),
                to: "EUR".into(),
                amount: 100.0
            }
        );
        assert_eq!(CurrencyArgs::parse(&json!({"from": "GBP", "to": "JPY"})).unwrap().amount, 1.0);
    }

    #[test]
    fn rejects_bad_codes_and_amounts() {
        assert!(matches!(
            CurrencyArgs::parse(&json!({"from": "DOLLAR", "to": "EUR"})),
            Err(GaiError::Validation { .. })
        ));
        assert!(CurrencyArgs::parse(&json!({"to": "EUR"})).is_err());
        assert!(CurrencyArgs::parse(&json!({"from": "USD", "to": "EUR", "amount": "ten"})).is_err());
        assert!(CurrencyArgs::parse(&json!({"from": "USD", "to": "EUR", "amount": -5})).is_err());
        assert!(CurrencyArgs::parse(&json!("USD to EUR")).is_err());
    }

    #[tokio::test]
    async fn converts_with_two_decimals() {
        let tool = CurrencyConverter::new(Arc::new(FixedRates::new(&[("USD", "EUR", 0.9234)])));
        let docs = tool
            .invoke(&json!({"from": "USD", "to": "EUR", "amount": 100}))
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].content, "100 USD converts to 92.34 EUR as of today");
        assert_eq!(docs[0].source(), CURRENCY_TOOL);
    }

    #[tokio::test]
    async fn missing_rate_is_reported_in_text() {
        let tool = CurrencyConverter::new(Arc::new(FixedRates::new(&[])));
        let docs = tool.invoke(&json!({"from": "USD", "to": "XYZ"})).await.unwrap();
        assert_eq!(docs[0].content, "No exchange rate found for USD to XYZ");
    }

    #[tokio::test]
    async fn unreachable_rates_are_tool_failures() {
        let tool = CurrencyConverter::new(Arc::new(FixedRates::unreachable()));
        let err = tool
            .invoke(&json!({"from": "USD", "to": "EUR"}))
            .await
            .unwrap_err();
        assert!(matches!(err, GaiError::ToolFailure { .. }));
    }

    #[test]
    fn fractional_amounts_keep_their_digits() {
        assert_eq!(format_amount(100.0), "100");
        assert_eq!(format_amount(12.5), "12.5");
    }
}
