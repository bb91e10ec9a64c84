//! Static service and event name tables.

use blpgw_core::constants::DEFAULT_SUBSCRIPTION_SERVICE;

/// Known request name → response event name pairs, grouped by service.
const REQUEST_TO_RESPONSE: &[(&str, &str)] = &[
    // //blp/refdata
    ("HistoricalDataRequest", "HistoricalDataResponse"),
    ("IntraDayTickRequest", "IntraDayTickResponse"),
    ("IntraDayBarRequest", "IntraDayBarResponse"),
    ("ReferenceDataRequest", "ReferenceDataResponse"),
    ("PortfolioDataRequest", "PortfolioDataResponse"),
    ("BeqsRequest", "BeqsResponse"),
    // //blp/apiflds
    ("FieldInfoRequest", "fieldResponse"),
    ("FieldSearchRequest", "fieldResponse"),
    ("CategorizedFieldSearchRequest", "categorizedFieldResponse"),
    // //blp/instruments
    ("instrumentListRequest", "InstrumentListResponse"),
    ("curveListRequest", "CurveListResponse"),
    ("govtListRequest", "GovtListResponse"),
    // //blp/tasvc
    ("studyRequest", "studyResponse"),
];

const MARKET_DATA_EVENTS: &[&str] = &["MarketDataEvents"];
const MARKET_BAR_EVENTS: &[&str] = &[
    "MarketBarStart",
    "MarketBarUpdate",
    "MarketBarEnd",
    "MarketBarIntervalEnd",
];
const PAGE_DATA_EVENTS: &[&str] = &["PageUpdate"];

/// Response event name for a request name.
///
/// Unknown names drop a trailing `Request`, collapse a leading `Field...` to
/// `field`, and append `Response`.
pub fn response_name(request: &str) -> String {
    if let Some((_, resp)) = REQUEST_TO_RESPONSE.iter().find(|(req, _)| *req == request) {
        return (*resp).to_string();
    }
    let base = request.strip_suffix("Request").unwrap_or(request);
    let base = if base.len() > "Field".len() && base.starts_with("Field") {
        "field"
    } else {
        base
    };
    format!("{base}Response")
}

/// Service URI a subscription's security targets.
///
/// A security starting with `//blp/<lowercase>` names its service; anything
/// else goes to `//blp/mktdata`.
pub fn service_for_security(security: &str) -> &str {
    const PREFIX: &str = "//blp/";
    if let Some(rest) = security.strip_prefix(PREFIX) {
        let name_len = rest.bytes().take_while(u8::is_ascii_lowercase).count();
        if name_len > 0 {
            return &security[..PREFIX.len() + name_len];
        }
    }
    DEFAULT_SUBSCRIPTION_SERVICE
}

/// Event names a subscription on `uri` receives data under.
pub fn events_for_service(uri: &str) -> &'static [&'static str] {
    match uri {
        "//blp/mktbar" => MARKET_BAR_EVENTS,
        "//blp/pagedata" => PAGE_DATA_EVENTS,
        _ => MARKET_DATA_EVENTS,
    }
}

/// Service URI for a request addressed by namespace and service name.
pub fn request_service_uri(ns: &str, service: &str) -> String {
    format!("//{ns}/{service}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_response_names() {
        assert_eq!(response_name("HistoricalDataRequest"), "HistoricalDataResponse");
        assert_eq!(response_name("FieldInfoRequest"), "fieldResponse");
        assert_eq!(
            response_name("CategorizedFieldSearchRequest"),
            "categorizedFieldResponse"
        );
        assert_eq!(response_name("instrumentListRequest"), "InstrumentListResponse");
        assert_eq!(response_name("studyRequest"), "studyResponse");
    }

    #[test]
    fn fallback_response_names() {
        assert_eq!(response_name("CustomThingRequest"), "CustomThingResponse");
        assert_eq!(response_name("FieldListRequest"), "fieldResponse");
        assert_eq!(response_name("Field"), "FieldResponse");
        assert_eq!(response_name("Odd"), "OddResponse");
    }

    #[test]
    fn service_resolution() {
        assert_eq!(service_for_security("AAPL US Equity"), "//blp/mktdata");
        assert_eq!(service_for_security("//blp/mktbar/ticker/IBM US Equity"), "//blp/mktbar");
        assert_eq!(service_for_security("//blp/pagedata/0708/012/0001"), "//blp/pagedata");
        assert_eq!(service_for_security("//blp/"), "//blp/mktdata");
        assert_eq!(service_for_security("//blp/Upper"), "//blp/mktdata");
    }

    #[test]
    fn service_events() {
        assert_eq!(events_for_service("//blp/mktdata"), &["MarketDataEvents"]);
        assert_eq!(events_for_service("//blp/mktvwap"), &["MarketDataEvents"]);
        assert_eq!(events_for_service("//blp/mktbar").len(), 4);
        assert_eq!(events_for_service("//blp/pagedata"), &["PageUpdate"]);
        assert_eq!(events_for_service("//blp/unknown"), &["MarketDataEvents"]);
    }

    #[test]
    fn request_uri() {
        assert_eq!(request_service_uri("blp", "refdata"), "//blp/refdata");
    }
}
