//! CLF Distribution WebOrdering client.
//!
//! SOAP 1.1 over HTTP POST. The token lifecycle is an explicit state
//! machine (`Unauthenticated -> Authenticated -> Expired`): every call
//! ensures a token first, and an in-band auth-error response marks the
//! token expired and refreshes it exactly once before surfacing
//! `ApiError::Authentication`. Token issuance is counted per run and
//! capped; past the cap every call fails with `TokenLimitExceeded`.

use crate::config::ClfCredentials;
use crate::error::ApiError;
use crate::sync::StockRecord;
use quick_xml::events::Event;
use quick_xml::Reader;

/// Token-issuance quota for one run.
pub const MAX_TOKEN_ATTEMPTS: u32 = 20;

const AUTH_ERROR_MESSAGE: &str = "Please call GetAuthenticationToken() first";

#[derive(Debug)]
enum TokenState {
    Unauthenticated,
    Authenticated(String),
    Expired,
}

pub struct ClfClient<'a> {
    agent: &'a ureq::Agent,
    credentials: &'a ClfCredentials,
    state: TokenState,
    tokens_issued: u32,
}

impl<'a> ClfClient<'a> {
    pub fn new(agent: &'a ureq::Agent, credentials: &'a ClfCredentials) -> Self {
        ClfClient {
            agent,
            credentials,
            state: TokenState::Unauthenticated,
            tokens_issued: 0,
        }
    }

    /// Fetch the full stock snapshot: the SKU list, then the stock level
    /// for each SKU. A record whose stock response cannot be parsed is
    /// skipped (data-quality failure, not fatal); auth and token-limit
    /// errors abort the fetch.
    pub fn fetch_stock(&mut self) -> Result<Vec<StockRecord>, ApiError> {
        let codes = self.fetch_product_codes()?;
        tracing::info!(count = codes.len(), "retrieved product codes");

        let mut records = Vec::with_capacity(codes.len());
        for code in codes {
            match self.fetch_product_stock(&code) {
                Ok(quantity) => records.push(StockRecord {
                    sku: code,
                    quantity,
                }),
                Err(err @ (ApiError::TokenLimitExceeded | ApiError::Authentication(_))) => {
                    return Err(err);
                }
                Err(err) => {
                    tracing::error!(sku = %code, error = %err, "skipping product with unreadable stock");
                }
            }
        }
        Ok(records)
    }

    /// Issue a fresh authentication token, counting against the quota.
    fn authenticate(&mut self) -> Result<String, ApiError> {
        if self.tokens_issued >= MAX_TOKEN_ATTEMPTS {
            return Err(ApiError::TokenLimitExceeded);
        }
        self.tokens_issued += 1;
        tracing::info!(
            attempt = self.tokens_issued,
            quota = MAX_TOKEN_ATTEMPTS,
            "requesting authentication token"
        );

        let payload = envelope(
            "<WebServiceHeader xmlns=\"http://services.clfdistribution.com/CLFWebOrdering\" />",
            &format!(
                "<GetAuthenticationToken xmlns=\"http://services.clfdistribution.com/CLFWebOrdering\">\
                 <Username>{}</Username><Password>{}</Password>\
                 </GetAuthenticationToken>",
                xml_escape(&self.credentials.username),
                xml_escape(&self.credentials.password)
            ),
        );
        let body = self.post(&payload)?;

        match element_text(&body, "GetAuthenticationTokenResult")? {
            Some(token) if !token.is_empty() => {
                tracing::info!("authentication token retrieved");
                self.state = TokenState::Authenticated(token.clone());
                Ok(token)
            }
            _ => {
                self.state = TokenState::Unauthenticated;
                Err(ApiError::Authentication(
                    "token not found in response".to_string(),
                ))
            }
        }
    }

    fn ensure_token(&mut self) -> Result<String, ApiError> {
        match &self.state {
            TokenState::Authenticated(token) => Ok(token.clone()),
            TokenState::Unauthenticated | TokenState::Expired => self.authenticate(),
        }
    }

    /// Send a tokenized SOAP request, refreshing the token exactly once
    /// if the service reports it expired.
    fn soap_call(&mut self, build: &dyn Fn(&str) -> String) -> Result<String, ApiError> {
        let token = self.ensure_token()?;
        let body = self.post(&build(&token))?;
        if !is_auth_error(&body) {
            return Ok(body);
        }

        tracing::warn!("authentication token expired, refreshing");
        self.state = TokenState::Expired;
        let token = self.authenticate()?;
        let body = self.post(&build(&token))?;
        if is_auth_error(&body) {
            return Err(ApiError::Authentication(
                "token rejected after refresh".to_string(),
            ));
        }
        Ok(body)
    }

    fn fetch_product_codes(&mut self) -> Result<Vec<String>, ApiError> {
        let body = self.soap_call(&|token| {
            envelope(
                &tokenized_header(token),
                "<GetProductCodes xmlns=\"http://services.clfdistribution.com/CLFWebOrdering\" />",
            )
        })?;

        // The result element carries the code list as escaped inner XML.
        let Some(inner) = element_text(&body, "GetProductCodesResult")? else {
            tracing::warn!("no product codes found");
            return Ok(Vec::new());
        };
        collect_element_texts(&inner, "sku")
    }

    fn fetch_product_stock(&mut self, code: &str) -> Result<u32, ApiError> {
        let body = self.soap_call(&|token| {
            envelope(
                &tokenized_header(token),
                &format!(
                    "<GetProductStock xmlns=\"http://services.clfdistribution.com/CLFWebOrdering\">\
                     <productCodesXml>&lt;ProductCodes&gt;&lt;Code&gt;{}&lt;/Code&gt;&lt;/ProductCodes&gt;</productCodesXml>\
                     </GetProductStock>",
                    xml_escape(code)
                ),
            )
        })?;

        let Some(inner) = element_text(&body, "GetProductStockResult")? else {
            return Err(ApiError::Parse(format!(
                "no stock result for product {code}"
            )));
        };
        match element_text(&inner, "stock")? {
            Some(text) if !text.is_empty() => parse_stock_level(&text)
                .ok_or_else(|| ApiError::Parse(format!("invalid stock value: {text}"))),
            // Missing stock normalizes to zero before diffing.
            _ => Ok(0),
        }
    }

    fn post(&self, payload: &str) -> Result<String, ApiError> {
        let mut response = self
            .agent
            .post(self.credentials.base_url.as_str())
            .header("content-type", "text/xml")
            .send(payload)
            .map_err(|err| ApiError::Network(err.to_string()))?;
        let status = response.status();
        let body = response
            .body_mut()
            .read_to_string()
            .map_err(|err| ApiError::Network(err.to_string()))?;
        if !status.is_success() {
            return Err(ApiError::Network(format!(
                "CLF responded with status {status}"
            )));
        }
        Ok(body)
    }
}

/// Negative values normalize to zero before diffing.
fn parse_stock_level(text: &str) -> Option<u32> {
    let value: i64 = text.trim().parse().ok()?;
    Some(value.clamp(0, i64::from(u32::MAX)) as u32)
}

fn is_auth_error(body: &str) -> bool {
    matches!(
        element_text(body, "ErrorMessage"),
        Ok(Some(message)) if message == AUTH_ERROR_MESSAGE
    )
}

fn envelope(header: &str, body: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
         <soap:Envelope xmlns:soap=\"http://schemas.xmlsoap.org/soap/envelope/\" \
         xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\" \
         xmlns:xsd=\"http://www.w3.org/2001/XMLSchema\">\
         <soap:Header>{header}</soap:Header>\
         <soap:Body>{body}</soap:Body>\
         </soap:Envelope>"
    )
}

fn tokenized_header(token: &str) -> String {
    format!(
        "<WebServiceHeader xmlns=\"http://services.clfdistribution.com/CLFWebOrdering\">\
         <AuthenticationToken>{}</AuthenticationToken>\
         </WebServiceHeader>",
        xml_escape(token)
    )
}

fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Text content of the first element with the given local name, ignoring
/// namespaces. `None` when the element is absent.
fn element_text(xml: &str, name: &str) -> Result<Option<String>, ApiError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut inside = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) if start.local_name().as_ref() == name.as_bytes() => {
                inside = true;
            }
            Ok(Event::Text(text)) if inside => {
                let unescaped = text
                    .unescape()
                    .map_err(|err| ApiError::Parse(err.to_string()))?;
                return Ok(Some(unescaped.into_owned()));
            }
            Ok(Event::CData(data)) if inside => {
                return Ok(Some(String::from_utf8_lossy(&data).into_owned()));
            }
            Ok(Event::End(_)) if inside => return Ok(Some(String::new())),
            Ok(Event::Eof) => return Ok(None),
            Ok(_) => {}
            Err(err) => return Err(ApiError::Parse(err.to_string())),
        }
    }
}

/// Text content of every element with the given local name, in document
/// order.
fn collect_element_texts(xml: &str, name: &str) -> Result<Vec<String>, ApiError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut inside = false;
    let mut values = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) if start.local_name().as_ref() == name.as_bytes() => {
                inside = true;
            }
            Ok(Event::Text(text)) if inside => {
                let unescaped = text
                    .unescape()
                    .map_err(|err| ApiError::Parse(err.to_string()))?;
                values.push(unescaped.into_owned());
                inside = false;
            }
            Ok(Event::End(_)) => inside = false,
            Ok(Event::Eof) => return Ok(values),
            Ok(_) => {}
            Err(err) => return Err(ApiError::Parse(err.to_string())),
        }
    }
}
