//! Embedded handlebars templates for the browser-facing pages. Kept small
//! and inline: this surface is a local control panel, not a product UI.

use handlebars::Handlebars;

pub const AUTH_URL_TEMPLATE: &str = "auth_url";
pub const STATUS_TEMPLATE: &str = "status";
pub const EXPORTS_TEMPLATE: &str = "exports";
pub const CALLBACK_TEMPLATE: &str = "callback";

const AUTH_URL_SOURCE: &str = r#"<html>
<head><title>Trakt authorization</title></head>
<body>
<h1>Connect your Trakt account</h1>
<p>Authorize this tool to read your Trakt history, ratings, and watchlist.</p>
<a href="{{authorization_url}}" id="authorize-link">Authorize with Trakt</a>
</body>
</html>
"#;

const STATUS_SOURCE: &str = r#"<html>
<head><title>Trakt export status</title></head>
<body>
<h1>Status</h1>
<ul>
<li>Authenticated: {{authenticated}}</li>
<li>Export running: {{running}}</li>
{{#if mode}}<li>Current mode: {{mode}}</li>{{/if}}
{{#if message}}<li>Last message: {{message}}</li>{{/if}}
<li>Uptime (seconds): {{uptime_seconds}}</li>
</ul>
<form method="post" action="/api/export?type=normal" enctype="application/x-www-form-urlencoded">
<input type="hidden" name="csrf_token" value="{{csrf_token}}">
<button type="submit">Run export</button>
</form>
<p><a href="/exports">View exports</a></p>
</body>
</html>
"#;

const EXPORTS_SOURCE: &str = r#"<html>
<head><title>Trakt exports</title></head>
<body>
<h1>Exports (page {{page}} of {{total_pages}})</h1>
<table>
<tr><th>ID</th><th>Type</th><th>Date</th><th>Status</th><th>Records</th><th>Files</th></tr>
{{#each items}}
<tr>
<td>{{this.id}}</td>
<td>{{this.export_type}}</td>
<td>{{this.date}}</td>
<td>{{this.status}}</td>
<td>{{this.record_count}}</td>
<td>
{{#each this.files}}<a href="/download/{{../this.id}}/{{this}}">{{this}}</a> {{/each}}
</td>
</tr>
{{/each}}
</table>
{{#if has_prev}}<a href="/exports?page={{prev_page}}">Previous</a>{{/if}}
{{#if has_next}}<a href="/exports?page={{next_page}}">Next</a>{{/if}}
</body>
</html>
"#;

const CALLBACK_SOURCE: &str = r#"<html>
<head><title>Trakt callback</title></head>
<body>
{{#if success}}
<h1>Authorization complete</h1>
<p>You can close this tab.</p>
{{else}}
<h1>Authorization failed</h1>
<p>{{error}}</p>
{{/if}}
</body>
</html>
"#;

pub fn register_templates() -> Handlebars<'static> {
    let mut registry = Handlebars::new();
    registry.set_strict_mode(false);
    registry
        .register_template_string(AUTH_URL_TEMPLATE, AUTH_URL_SOURCE)
        .expect("auth_url template is valid handlebars");
    registry
        .register_template_string(STATUS_TEMPLATE, STATUS_SOURCE)
        .expect("status template is valid handlebars");
    registry
        .register_template_string(EXPORTS_TEMPLATE, EXPORTS_SOURCE)
        .expect("exports template is valid handlebars");
    registry
        .register_template_string(CALLBACK_TEMPLATE, CALLBACK_SOURCE)
        .expect("callback template is valid handlebars");
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_template_renders_without_optional_fields() {
        let registry = register_templates();
        let rendered = registry
            .render(
                STATUS_TEMPLATE,
                &json!({
                    "authenticated": true,
                    "running": false,
                    "uptime_seconds": 12,
                    "csrf_token": "abc",
                }),
            )
            .unwrap();
        assert!(rendered.contains("Authenticated: true"));
    }

    #[test]
    fn exports_template_renders_empty_list() {
        let registry = register_templates();
        let rendered = registry
            .render(
                EXPORTS_TEMPLATE,
                &json!({
                    "items": [],
                    "page": 1,
                    "total_pages": 1,
                    "has_prev": false,
                    "has_next": false,
                }),
            )
            .unwrap();
        assert!(rendered.contains("Exports (page 1 of 1)"));
    }
}
