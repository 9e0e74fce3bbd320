/*
 * Copyright 2024 Oxide Computer Company
 */

use super::prelude::*;

use thiserror::Error;

use crate::jobs::Jobs;

#[derive(Deserialize, JsonSchema)]
pub(crate) struct HostPath {
    #[allow(dead_code)]
    host: String,
}

#[derive(Deserialize, JsonSchema)]
pub(crate) struct JobPath {
    host: String,
    id: String,
}

impl JobPath {
    fn job_id(&self) -> String {
        format!("{}/{}", self.host, self.id)
    }
}

/**
 * Failure to admit a job.  Classified failures are always a 400 whose body
 * is the stable code and message, so that clients can tell them apart.
 */
#[derive(Debug, Error, Serialize, JsonSchema)]
#[error("{message} ({code})")]
pub(crate) struct SubmitError {
    code: u32,
    message: String,
    #[serde(skip)]
    status: ErrorStatusCode,
}

impl From<ErrorKind> for SubmitError {
    fn from(kind: ErrorKind) -> Self {
        let ErrorBody { code, message } = kind.body();
        SubmitError { code, message, status: ErrorStatusCode::BAD_REQUEST }
    }
}

/*
 * Errors raised by dropshot before the handler runs.  Anything wrong with the
 * request body is an invalid request; a server-side failure keeps its status
 * and reports that status as the code.
 */
impl From<HttpError> for SubmitError {
    fn from(e: HttpError) -> Self {
        if e.status_code.is_client_error() {
            ErrorKind::InvalidRequest.into()
        } else {
            SubmitError {
                code: e.status_code.as_u16().into(),
                message: e.external_message,
                status: e.status_code,
            }
        }
    }
}

impl HttpResponseError for SubmitError {
    fn status_code(&self) -> ErrorStatusCode {
        self.status
    }
}

/**
 * Validate and admit a job.
 */
pub(crate) fn submit(
    log: &Logger,
    jobs: &Arc<Jobs>,
    req: JobRequest,
) -> Result<JobSubmitResult, SubmitError> {
    if let Err(e) = req.validate() {
        warn!(log, "{e}");
        return Err(ErrorKind::InvalidRequest.into());
    }

    let id = jobs.add_job(req).map_err(|e| {
        warn!(log, "job not admitted: {e}");
        e.kind()
    })?;

    Ok(JobSubmitResult { id: id.to_string() })
}

#[endpoint {
    method = GET,
    path = "/api/builder/container",
}]
pub(crate) async fn containers_get(
    rqctx: RequestContext<Arc<Central>>,
) -> DSResult<HttpResponseOk<PoolStatus>> {
    let c = rqctx.context();

    Ok(HttpResponseOk(c.jobs.status()))
}

#[endpoint {
    method = POST,
    path = "/api/builder/container",
}]
pub(crate) async fn container_submit(
    rqctx: RequestContext<Arc<Central>>,
    body: TypedBody<JobRequest>,
) -> Result<HttpResponseOk<JobSubmitResult>, SubmitError> {
    let c = rqctx.context();
    let log = &rqctx.log;

    let res = submit(log, &c.jobs, body.into_inner())?;
    info!(log, "submitted job {}", res.id);

    Ok(HttpResponseOk(res))
}

/*
 * The host-level resource has no state of its own.  It answers the same way
 * for any host, so that clients can treat every host alike.
 */

#[endpoint {
    method = GET,
    path = "/api/builder/container/{host}",
}]
pub(crate) async fn container_host_get(
    _rqctx: RequestContext<Arc<Central>>,
    _path: TypedPath<HostPath>,
) -> DSResult<HttpResponseOk<HostStatus>> {
    Ok(HttpResponseOk(HostStatus { status: None }))
}

#[endpoint {
    method = DELETE,
    path = "/api/builder/container/{host}",
}]
pub(crate) async fn container_host_delete(
    _rqctx: RequestContext<Arc<Central>>,
    _path: TypedPath<HostPath>,
) -> DSResult<HttpResponseOk<Empty>> {
    Ok(HttpResponseOk(Empty {}))
}

#[endpoint {
    method = GET,
    path = "/api/builder/container/{host}/{id}",
}]
pub(crate) async fn container_get(
    rqctx: RequestContext<Arc<Central>>,
    path: TypedPath<JobPath>,
) -> DSResult<HttpResponseOk<JobStatus>> {
    let c = rqctx.context();
    let p = path.into_inner();

    Ok(HttpResponseOk(c.jobs.job_status(&p.job_id())))
}

#[endpoint {
    method = DELETE,
    path = "/api/builder/container/{host}/{id}",
}]
pub(crate) async fn container_cancel(
    rqctx: RequestContext<Arc<Central>>,
    path: TypedPath<JobPath>,
) -> DSResult<HttpResponseOk<Empty>> {
    let c = rqctx.context();
    let p = path.into_inner();

    c.jobs.cancel_job(&p.job_id());

    Ok(HttpResponseOk(Empty {}))
}
