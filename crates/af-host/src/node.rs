//! The request node handed to [`crate::Orchestrator::send`].

use std::collections::BTreeMap;

use af_sandbox::{BodyData, BodyType, HeaderValue, InitialState, VariableValue};
use serde::{Deserialize, Serialize};

/// The editable request of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestModel {
    /// HTTP method.
    pub method: String,
    /// Target URL.
    pub url: String,
    /// Path appended to `url`.
    pub path: String,
    /// Query parameters.
    pub query_params: BTreeMap<String, String>,
    /// Path parameters substituted into `{name}` placeholders.
    pub path_params: BTreeMap<String, String>,
    /// Headers; [`HeaderValue::Cleared`] suppresses a header.
    pub headers: BTreeMap<String, HeaderValue>,
    /// Body data for every variant.
    pub body: BodyData,
    /// The active body variant.
    pub body_type: BodyType,
}

impl Default for RequestModel {
    fn default() -> Self {
        Self {
            method: "GET".into(),
            url: String::new(),
            path: String::new(),
            query_params: BTreeMap::new(),
            path_params: BTreeMap::new(),
            headers: BTreeMap::new(),
            body: BodyData::default(),
            body_type: BodyType::None,
        }
    }
}

/// A request node as selected in the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestNode {
    /// Node id; also the storage cache key.
    pub id: String,
    /// Owning project.
    #[serde(default)]
    pub project_id: Option<String>,
    /// The request to send.
    #[serde(default)]
    pub request: RequestModel,
    /// Variables visible to templates and scripts.
    #[serde(default)]
    pub variables: BTreeMap<String, VariableValue>,
    /// Cookies sent with the request.
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    /// Script run before the request is sent.
    #[serde(default)]
    pub pre_request_script: Option<String>,
}

impl RequestNode {
    /// A node with a default request.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            project_id: None,
            request: RequestModel::default(),
            variables: BTreeMap::new(),
            cookies: BTreeMap::new(),
            pre_request_script: None,
        }
    }

    /// The attached script, if it has any content.
    pub fn script(&self) -> Option<&str> {
        self.pre_request_script
            .as_deref()
            .filter(|s| !s.trim().is_empty())
    }

    /// The seed snapshot for a sandbox, with persisted storage filled in.
    pub fn initial_state(
        &self,
        local_storage: BTreeMap<String, String>,
        session_storage: BTreeMap<String, String>,
    ) -> InitialState {
        let request = self.request.clone();
        InitialState {
            method: request.method,
            url: request.url,
            path: request.path,
            query_params: request.query_params,
            path_params: request.path_params,
            headers: request.headers,
            body: request.body,
            body_type: request.body_type,
            variables: self.variables.clone(),
            cookies: self.cookies.clone(),
            local_storage,
            session_storage,
            node_id: Some(self.id.clone()),
            project_id: self.project_id.clone(),
        }
    }
}
