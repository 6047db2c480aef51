use crate::api::BackendClient;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) backend: BackendClient,
}
