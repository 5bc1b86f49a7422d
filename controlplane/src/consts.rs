// The system namespace for Aska resources.
pub const ASKA_NAMESPACE: &str = "aska-system";

// The app label value to identify an Aska resource.
pub const ASKA_APP_LABEL: &str = "aska";

// The component label value to identify the Aska data-plane component.
pub const ASKA_DATAPLANE_COMPONENT_LABEL: &str = "dataplane";

// The finalizer used for Aska dataplane cleanup.
pub const DATAPLANE_FINALIZER: &str = "aska.gateway.networking.k8s.io/dataplane";

// The well-known port every Node Agent serves its gRPC API on.
pub const DATAPLANE_API_PORT: u16 = 9874;

// Controller name for the Aska GatewayClass.
pub const GATEWAY_CLASS_CONTROLLER_NAME: &str = "gateway.networking.k8s.io/aska";

// Field manager for Aska.
pub const ASKA_FIELD_MANAGER: &str = "aska-field-manager";

// Label used to indicate that a Service is owned by an Aska Gateway.
pub const GATEWAY_SERVICE_LABEL: &str = "aska.gateway.networking.k8s.io/owned-by-gateway";
