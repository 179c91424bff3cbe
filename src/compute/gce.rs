// [[file:../../fleet.note::6e2c94d1][6e2c94d1]]
use super::*;

use reqwest::Response;
use serde_json::{json, Value};
// 6e2c94d1 ends here

// [[file:../../fleet.note::a5f1b380][a5f1b380]]
/// Client of the Compute Engine REST API for one project and zone.
#[derive(Debug, Clone)]
pub struct GceApi {
    client: reqwest::Client,
    endpoint: String,
    project: String,
    zone: String,
    token: String,
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        Self::new(e.status().map(|s| s.as_u16()), e.to_string())
    }
}

impl GceApi {
    /// Connect to the API at `endpoint`, e.g.
    /// "https://compute.googleapis.com/compute/v1", authorizing every
    /// request with bearer `token`.
    pub fn connect(endpoint: &str, project: &str, zone: &str, token: &str) -> Result<Self, ApiError> {
        // by the default there is no timeout
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').into(),
            project: project.into(),
            zone: zone.into(),
            token: token.into(),
        })
    }

    /// Obtain an access token from the gcloud command line tool.
    pub async fn access_token_from_gcloud(gcloud: &str) -> Result<String, ApiError> {
        let out = tokio::process::Command::new(gcloud)
            .args(["auth", "print-access-token"])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ApiError::new(None, format!("failed to run {gcloud}: {e}")))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(ApiError::new(None, format!("no access token: {}", stderr.trim())));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    fn project_url(&self) -> String {
        format!("{}/projects/{}", self.endpoint, self.project)
    }

    fn zone_url(&self) -> String {
        format!("{}/zones/{}", self.project_url(), self.zone)
    }

    fn resource_url(&self, collection: &str, name: &str) -> String {
        match collection {
            "machineTypes" | "instances" => format!("{}/{collection}/{name}", self.zone_url()),
            _ => format!("{}/global/{collection}/{name}", self.project_url()),
        }
    }
}
// a5f1b380 ends here

// [[file:../../fleet.note::0c7b19e6][0c7b19e6]]
/// Turn an error response into `ApiError`, keeping the message of the
/// error body when there is one.
async fn check(resp: Response) -> Result<Response, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let txt = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&txt)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(|s| s.to_string()))
        .unwrap_or(txt);
    Err(ApiError::new(Some(status.as_u16()), message))
}

impl GceApi {
    async fn get_json<T: serde::de::DeserializeOwned>(&self, uri: &str, query: &[(&str, &str)]) -> Result<T, ApiError> {
        trace!("GET {uri}");
        let resp = self.client.get(uri).bearer_auth(&self.token).query(query).send().await?;
        Ok(check(resp).await?.json().await?)
    }

    async fn post_json(&self, uri: &str, data: &Value) -> Result<Operation, ApiError> {
        trace!("POST {uri}");
        let resp = self.client.post(uri).bearer_auth(&self.token).json(data).send().await?;
        Ok(check(resp).await?.json().await?)
    }

    async fn delete(&self, uri: &str) -> Result<Operation, ApiError> {
        trace!("DELETE {uri}");
        let resp = self.client.delete(uri).bearer_auth(&self.token).send().await?;
        Ok(check(resp).await?.json().await?)
    }

    fn instance_body(&self, request: &InstanceRequest) -> Value {
        let metadata = request
            .metadata
            .iter()
            .map(|(key, value)| json!({"key": key, "value": value}))
            .collect_vec();
        let access_configs = if request.external_ip {
            vec![json!({"kind": "compute#accessConfig", "type": "ONE_TO_ONE_NAT", "name": "External NAT"})]
        } else {
            vec![]
        };
        let mut body = json!({
            "kind": "compute#instance",
            "name": request.name,
            "machineType": self.resource_url("machineTypes", &request.machine_type),
            "disks": [{
                "kind": "compute#attachedDisk",
                "boot": true,
                "autoDelete": true,
                "mode": "READ_WRITE",
                "type": "PERSISTENT",
                "initializeParams": {"sourceImage": request.image},
            }],
            "metadata": {"kind": "compute#metadata", "items": metadata},
            "canIpForward": request.can_ip_forward,
            "networkInterfaces": [{
                "kind": "compute#instanceNetworkInterface",
                "network": self.resource_url("networks", "default"),
                "accessConfigs": access_configs,
            }],
            "serviceAccounts": [{
                "kind": "compute#serviceAccount",
                "email": "default",
                "scopes": request.scopes,
            }],
        });
        if !request.tags.is_empty() {
            body["tags"] = json!({"items": request.tags});
        }
        body
    }
}
// 0c7b19e6 ends here

// [[file:../../fleet.note::f03c6a8d][f03c6a8d]]
#[async_trait]
impl ComputeApi for GceApi {
    async fn create_instance(&self, request: &InstanceRequest) -> Result<Operation, ApiError> {
        debug!("create instance {}", request.name);
        let uri = format!("{}/instances", self.zone_url());
        self.post_json(&uri, &self.instance_body(request)).await
    }

    async fn get_instance(&self, name: &str) -> Result<Option<Instance>, ApiError> {
        match self.get_json(&self.resource_url("instances", name), &[]).await {
            Ok(instance) => Ok(Some(instance)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_instances(&self, filter: &str) -> Result<Vec<Instance>, ApiError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct InstanceList {
            #[serde(default)]
            items: Vec<Instance>,
            next_page_token: Option<String>,
        }

        let uri = format!("{}/instances", self.zone_url());
        let mut instances = vec![];
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![("filter", filter)];
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }
            let page: InstanceList = self.get_json(&uri, &query).await?;
            instances.extend(page.items);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(instances)
    }

    async fn delete_instance(&self, name: &str) -> Result<Operation, ApiError> {
        debug!("delete instance {name}");
        self.delete(&self.resource_url("instances", name)).await
    }

    async fn get_operation(&self, op: &Operation) -> Result<Operation, ApiError> {
        let uri = match op.self_link.as_deref() {
            Some(link) => link.to_string(),
            None => format!("{}/operations/{}", self.zone_url(), op.name),
        };
        self.get_json(&uri, &[]).await
    }

    async fn insert_route(&self, request: &RouteRequest) -> Result<Operation, ApiError> {
        debug!("insert route {}", request.name);
        let body = json!({
            "kind": "compute#route",
            "name": request.name,
            "network": self.resource_url("networks", "default"),
            "destRange": request.dest_range,
            "nextHopInstance": self.resource_url("instances", &request.next_hop_instance),
            "priority": request.priority,
            "tags": request.tags,
        });
        let uri = format!("{}/global/routes", self.project_url());
        self.post_json(&uri, &body).await
    }

    async fn delete_route(&self, name: &str) -> Result<Operation, ApiError> {
        debug!("delete route {name}");
        self.delete(&self.resource_url("routes", name)).await
    }
}
// f03c6a8d ends here

// [[file:../../fleet.note::79d2e4bb][79d2e4bb]]
#[test]
fn test_instance_body() {
    let api = GceApi::connect("https://compute.example/v1/", "proj", "zone-a", "t").unwrap();
    let mut metadata = BTreeMap::new();
    metadata.insert("role".to_string(), "worker".to_string());
    let request = InstanceRequest {
        name: "ab-hw-000".into(),
        machine_type: "n1-highcpu-4".into(),
        image: "projects/debian-cloud/global/images/family/debian-11".into(),
        metadata,
        external_ip: false,
        can_ip_forward: false,
        tags: vec!["ab-hw-no-ip".into()],
        scopes: vec!["scope-a".into()],
    };
    let body = api.instance_body(&request);
    assert_eq!(
        body["machineType"],
        "https://compute.example/v1/projects/proj/zones/zone-a/machineTypes/n1-highcpu-4"
    );
    assert_eq!(body["metadata"]["items"][0]["key"], "role");
    assert_eq!(body["networkInterfaces"][0]["accessConfigs"].as_array().unwrap().len(), 0);
    assert_eq!(body["tags"]["items"][0], "ab-hw-no-ip");
    assert_eq!(body["serviceAccounts"][0]["scopes"][0], "scope-a");
}
// 79d2e4bb ends here
