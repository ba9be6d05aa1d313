/* STATIC Proxy (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

//! Connection pool: tasks, workers and the dispatcher that routes one to the other.

pub mod connect;
pub mod dispatcher;
pub mod http1_worker;
pub mod http2_worker;
pub mod task;
pub mod worker;

pub use connect::{AsyncIo, ConnectionManager, IpManager, SecuredConnection, StaticIpManager, TlsConnectionManager};
pub use dispatcher::{Dispatcher, DispatcherStats, WorkerSummary};
pub use http1_worker::Http1Worker;
pub use http2_worker::Http2Worker;
pub use task::{Response, Task, FAILURE_STATUS};
pub use worker::{TaskRouter, Worker, WorkerCore, WorkerSpec};
