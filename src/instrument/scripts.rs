//! Capability scripts installed into the page
//!
//! The globals these scripts define are the compatibility surface with
//! existing suites: `window.isCallingAjax`, `window.mutationObserver`,
//! `window.requestArray`, `window.requestCount`, `document.getElementByXpath`
//! and `window.events` keep their names.
//!
//! Each script guards itself so a second install into the same document is
//! a no-op (re-wrapping XHR twice would double count requests).

/// Quiescence probes: network check, mutation counter/observer, busy-timer harness
pub const QUIESCENCE_PROBES: &str = r#"
if (window.mutationObserver === undefined) {
    window.isCallingAjax = function () {
        return (window.requestCount || 0) > 0;
    };

    window.mutationCount = 0;
    window.prev_mutationCount = 0;

    MutationObserver.prototype.getCount = function () {
        return window.mutationCount;
    };

    MutationObserver.prototype.haveNewMutations = function () {
        var changed = window.prev_mutationCount !== window.mutationCount;
        window.prev_mutationCount = window.mutationCount;
        return changed;
    };

    // Count only; logging each mutation stalls pages that emit tens of thousands
    window.mutationObserver = new MutationObserver(function (mutations) {
        window.mutationCount += mutations.length;
    });

    window.mutationObserver.observe(document.documentElement, {
        attributes: true,
        characterData: true,
        childList: true,
        subtree: true,
        attributeOldValue: true,
        characterDataOldValue: true
    });

    window.doMovingAverage_BUSYwait = function (started, callback) {
        callback(Math.abs(new Date() - started));
    };
}
"#;

/// Network shim: wraps XHR open/send and fetch, logs
/// `[url, method, body, responseBody, statusCode, statusText]` tuples
pub const NETWORK_MONITOR: &str = r#"
if (XMLHttpRequest.prototype.realOpen === undefined) {
    window.requestArray = window.requestArray || [];
    window.requestCount = window.requestCount || 0;

    XMLHttpRequest.prototype.realOpen = XMLHttpRequest.prototype.open;
    XMLHttpRequest.prototype.realSend = XMLHttpRequest.prototype.send;

    XMLHttpRequest.prototype.open = function (method, url) {
        this._method = method;
        this._url = url;
        return XMLHttpRequest.prototype.realOpen.apply(this, arguments);
    };

    XMLHttpRequest.prototype.send = function (postData) {
        var xhr = this;
        xhr.addEventListener('loadend', function () {
            var text = (xhr.responseType === '' || xhr.responseType === 'text') ? xhr.responseText : null;
            var body = postData === undefined ? null : postData;
            window.requestArray.push([xhr._url, xhr._method, body, text, xhr.status, xhr.statusText]);
            window.requestCount--;
        });
        window.requestCount++;
        try {
            return XMLHttpRequest.prototype.realSend.apply(xhr, arguments);
        } catch (e) {
            window.requestCount--;
            throw e;
        }
    };

    if (typeof window.fetch === 'function') {
        var realFetch = window.fetch;
        window.fetch = function (input, init) {
            var url = typeof input === 'string' ? input : (input && input.url) || String(input);
            var method = (init && init.method) || (input && input.method) || 'GET';
            var body = (init && typeof init.body === 'string') ? init.body : null;
            window.requestCount++;
            return realFetch.apply(this, arguments).then(function (response) {
                // Streamed bodies may never end; the call is done once headers arrive
                window.requestCount--;
                response.clone().text().then(function (text) {
                    window.requestArray.push([url, method, body, text, response.status, response.statusText]);
                }, function () {
                    window.requestArray.push([url, method, body, null, response.status, response.statusText]);
                });
                return response;
            }, function (err) {
                window.requestArray.push([url, method, body, null, 0, String(err)]);
                window.requestCount--;
                throw err;
            });
        };
    }
}
"#;

/// DOM utilities: XPath lookup and a capturing event recorder.
///
/// Installs the context marker (`document.getElementByXpath`), so it must run last.
pub const DOM_UTILS: &str = r#"
if (typeof document.getElementByXpath == 'undefined') {
    window.events = window.events || [];

    document.processEvent = function (event) {
        var target = event.target && event.target.tagName ? event.target.tagName.toLowerCase() : null;
        window.events.push({ type: event.type, target: target, time: Date.now() });
    };

    ['submit', 'keypress', 'click', 'dblclick', 'dragstart', 'dragend', 'wheel'].forEach(function (name) {
        document.addEventListener(name, document.processEvent, true);
    });

    document.getElementByXpath = function (path) {
        return document.evaluate(path, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue;
    };
}
"#;

/// Marker check for an instrumented context
pub const MARKER_PRESENT: &str = "return typeof document.getElementByXpath != 'undefined';";

pub const NETWORK_PENDING: &str = "return window.isCallingAjax();";

pub const DOM_MUTATED: &str = "return window.mutationObserver.haveNewMutations();";

/// Confirming sample taken before declaring quiescence
pub const ACTIVITY_SNAPSHOT: &str = r#"
return {
    loading: document.readyState != 'complete',
    networkPending: window.isCallingAjax(),
    domMutated: window.mutationObserver.haveNewMutations()
};
"#;

pub const READY_STATE: &str = "return document.readyState;";

pub const CALL_LOG_LENGTH: &str = "return window.requestArray.length;";

pub const RECORDED_EVENT_COUNT: &str = "return window.events.length;";

/// Busy probe. Falls back to an inline harness so calibration works on an
/// uninstrumented page.
pub fn busy_latency(delay_ms: u64) -> String {
    format!(
        r#"
var done = arguments[arguments.length - 1];
var harness = window.doMovingAverage_BUSYwait || function (started, callback) {{
    callback(Math.abs(new Date() - started));
}};
setTimeout(harness, {delay_ms}, new Date(), done);
"#
    )
}

pub fn call_at(index: usize) -> String {
    format!("return window.requestArray[{}];", index)
}

pub fn xpath_exists(expression: &str) -> String {
    // JSON string literal is a valid JS string literal
    let literal = serde_json::Value::String(expression.to_string()).to_string();
    format!("return document.getElementByXpath({}) != null;", literal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_latency_embeds_delay() {
        let script = busy_latency(200);
        assert!(script.contains("setTimeout(harness, 200, new Date(), done)"));
        assert!(script.contains("arguments[arguments.length - 1]"));
    }

    #[test]
    fn test_xpath_is_escaped() {
        let script = xpath_exists(r#"//button[@title="Say \"hi\""]"#);
        assert_eq!(
            script,
            r#"return document.getElementByXpath("//button[@title=\"Say \\\"hi\\\"\"]") != null;"#
        );
    }

    #[test]
    fn test_fetch_settles_before_body_is_read() {
        let resolved = NETWORK_MONITOR
            .find("realFetch.apply(this, arguments).then(function (response) {")
            .unwrap();
        let rest = &NETWORK_MONITOR[resolved..];
        let decrement = rest.find("window.requestCount--").unwrap();
        let body_read = rest.find("response.clone().text()").unwrap();
        assert!(decrement < body_read);
        assert_eq!(rest[body_read..].find("}).then(function () {"), None);
    }

    #[test]
    fn test_dom_utils_installs_marker() {
        assert!(DOM_UTILS.contains("document.getElementByXpath = function"));
        assert!(MARKER_PRESENT.contains("document.getElementByXpath"));
    }
}
