use std::sync::Arc;

use axum::{routing::get, Json, Router};
use serde_json::{json, Map, Value};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{authz, delegation, models, reconcile, routes, store};

#[derive(OpenApi)]
#[openapi(
	paths(
		routes::health::health,
		routes::resources::tree,
		routes::access::check,
		routes::jobs::list_permissions,
		routes::jobs::replace_permissions,
		routes::jobs::save_permissions,
		routes::jobs::valid_scopes,
		routes::users::list_exceptions,
		routes::users::save_exceptions,
		routes::users::clear_exceptions,
		routes::delegations::list_access,
		routes::delegations::grant_access,
		routes::delegations::replace_access_scope,
		routes::delegations::revoke_access,
		routes::delegations::list_control,
		routes::delegations::grant_control,
		routes::delegations::replace_control_scope,
		routes::delegations::revoke_control
	),
	components(
		schemas(
			models::ResourceId,
			models::ResourceKind,
			models::ResourceNode,
			models::Label,
			models::Scope,
			models::ControlScope,
			models::Distribution,
			models::SubjectContext,
			models::Owner,
			models::JobPermission,
			models::ExceptionState,
			models::UserException,
			models::ResourceGrant,
			models::DelegationTarget,
			models::DelegationRule,
			authz::ValidScopes,
			authz::Decision,
			delegation::BatchOutcome,
			reconcile::EditState,
			reconcile::ConflictChoice,
			store::rpc::GrantSpec,
			routes::health::HealthResponse,
			routes::access::CheckRequest,
			routes::access::CheckResponse,
			routes::jobs::ReplacePermissionsRequest,
			routes::jobs::PermissionBatchRequest,
			routes::users::ExceptionBatchRequest,
			routes::delegations::AccessGrantRequest,
			routes::delegations::ControlGrantRequest
		)
	),
	tags(
		(name = "Health", description = "Service health"),
		(name = "Resources", description = "Service/page/action catalog"),
		(name = "Access", description = "Access resolution for the caller"),
		(name = "Jobs", description = "Job permission administration"),
		(name = "Users", description = "User exception administration"),
		(name = "Delegations", description = "Access and control delegation")
	)
)]
pub struct ApiDoc;

pub fn build_openapi(port: u16) -> anyhow::Result<utoipa::openapi::OpenApi> {
	let mut doc = serde_json::to_value(&ApiDoc::openapi())?;

	normalize_path_operations(&mut doc);
	ensure_security_components(&mut doc);
	ensure_global_security(&mut doc);
	ensure_openapi_version(&mut doc);
	add_examples(&mut doc);
	ensure_servers(&mut doc, port);

	Ok(serde_json::from_value(doc)?)
}

pub fn swagger_routes(doc: utoipa::openapi::OpenApi) -> anyhow::Result<Router> {
	let swagger_config = utoipa_swagger_ui::Config::new(["/api-docs/openapi.json"])
		.try_it_out_enabled(true)
		.with_credentials(true)
		.persist_authorization(true);

	let doc_json = Arc::new(serde_json::to_value(&doc)?);

	let json_route = {
		let doc_json = Arc::clone(&doc_json);
		get(move || {
			let doc_json = Arc::clone(&doc_json);
			async move { Json((*doc_json).clone()) }
		})
	};

	Ok(Router::new()
		.route("/api-docs/openapi.json", json_route)
		.merge(SwaggerUi::new("/docs").config(swagger_config)))
}

fn normalize_path_operations(doc: &mut Value) {
	if let Some(paths) = doc.get_mut("paths").and_then(Value::as_object_mut) {
		let snapshot = paths.clone();
		for (path, item) in snapshot {
			if let Some(ops) = item.as_object() {
				let mut normalized = Map::new();
				for (method, val) in ops {
					let key = method.to_lowercase();
					if let Some(existing) = normalized.get_mut(&key) {
						merge_values(existing, val);
					} else {
						normalized.insert(key, val.clone());
					}
				}
				paths.insert(path, Value::Object(normalized));
			}
		}
	}
}

fn object_entry<'a>(parent: &'a mut Value, key: &str) -> Option<&'a mut Map<String, Value>> {
	parent
		.as_object_mut()?
		.entry(key)
		.or_insert_with(|| Value::Object(Map::new()))
		.as_object_mut()
}

fn ensure_security_components(doc: &mut Value) {
	let Some(components) = object_entry(doc, "components") else { return; };
	let Some(schemes) = components
		.entry("securitySchemes")
		.or_insert_with(|| Value::Object(Map::new()))
		.as_object_mut()
	else {
		return;
	};

	schemes.insert(
		"bearerAuth".to_string(),
		json!({
			"type": "http",
			"scheme": "bearer",
			"bearerFormat": "JWT"
		}),
	);
}

fn ensure_global_security(doc: &mut Value) {
	if let Some(root) = doc.as_object_mut() {
		root.entry("security").or_insert_with(|| json!([{ "bearerAuth": [] }]));
	}
}

fn ensure_openapi_version(doc: &mut Value) {
	if let Some(root) = doc.as_object_mut() {
		root.entry("openapi").or_insert_with(|| Value::String("3.1.0".to_string()));
	}
}

fn add_examples(doc: &mut Value) {
	if let Some(paths) = doc.get_mut("paths").and_then(Value::as_object_mut) {
		for item in paths.values_mut() {
			if let Some(operations) = item.as_object_mut() {
				for operation in operations.values_mut() {
					apply_parameter_examples(operation);
					apply_request_examples(operation);
				}
			}
		}
	}
}

fn apply_parameter_examples(operation: &mut Value) {
	let Some(parameters) = operation.get_mut("parameters").and_then(Value::as_array_mut) else { return; };

	for parameter in parameters.iter_mut() {
		let example = match parameter.get("name").and_then(Value::as_str) {
			Some("owner") => json!("job:J1"),
			Some("job_id") => json!("J1"),
			Some("user_id") => json!("U1"),
			_ => continue,
		};
		if let Some(obj) = parameter.as_object_mut() {
			obj.entry("example").or_insert(example);
		}
	}
}

fn apply_request_examples(operation: &mut Value) {
	let Some(request_body) = operation.get_mut("requestBody") else { return; };
	let Some(content) = request_body.get_mut("content").and_then(Value::as_object_mut) else { return; };
	let Some(app_json) = content.get_mut("application/json").and_then(Value::as_object_mut) else { return; };
	let Some(schema) = app_json.get("schema").and_then(Value::as_object) else { return; };
	let Some(reference) = schema.get("$ref").and_then(Value::as_str) else { return; };

	let example = match reference {
		"#/components/schemas/CheckRequest" => Some(json!({
			"resources": ["s:5", "ss:12", "sss:3"],
			"explain": true
		})),
		"#/components/schemas/ReplacePermissionsRequest" => Some(json!({
			"grants": [
				{"resourceId": "s:5"},
				{"resourceId": "ss:12", "scope": {"company_id": "C1"}}
			]
		})),
		"#/components/schemas/PermissionBatchRequest" => Some(json!({
			"baseline": {"s:5": [{}]},
			"local": {"s:5": [{}], "ss:12": [{"company_id": "C1"}]},
			"force": false
		})),
		"#/components/schemas/ExceptionBatchRequest" => Some(json!({
			"baseline": {"sss:3": "denied"},
			"local": {"sss:3": "granted"},
			"force": false
		})),
		"#/components/schemas/AccessGrantRequest" => Some(json!({
			"resource_id": "ss:12",
			"scope": {"company_id": "C1", "section_id": "S1"}
		})),
		"#/components/schemas/ControlGrantRequest" => Some(json!({
			"target": "ALL",
			"scope": {"restricted_to_grantor_company": true}
		})),
		_ => None,
	};

	if let Some(example) = example {
		app_json.insert("example".to_string(), example);
	}
}

fn ensure_servers(doc: &mut Value, port: u16) {
	let server_url = format!("http://localhost:{}", port);

	match doc.get_mut("servers") {
		Some(Value::Array(arr)) => {
			let has = arr.iter().any(|v| v.get("url").and_then(Value::as_str) == Some(server_url.as_str()));
			if !has {
				arr.push(json!({ "url": server_url }));
			}
		}
		_ => {
			doc["servers"] = json!([{ "url": server_url }]);
		}
	}
}

fn merge_values(target: &mut Value, addition: &Value) {
	match (target, addition) {
		(Value::Object(dest), Value::Object(src)) => {
			for (key, value) in src {
				if let Some(existing) = dest.get_mut(key) {
					merge_values(existing, value);
				} else {
					dest.insert(key.clone(), value.clone());
				}
			}
		}
		(Value::Array(dest), Value::Array(src)) => {
			for item in src {
				if !dest.contains(item) {
					dest.push(item.clone());
				}
			}
		}
		_ => {}
	}
}
