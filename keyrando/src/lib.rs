pub mod analyze;
pub mod randomize;
pub mod route;
pub mod solve;
pub mod state;
pub mod traverse;

pub use randomize::{RouteFinder, RouteFinderError, RouteFinderOptions};
pub use route::{Route, RouteSummary};
pub use solve::{
    solve_route, RouteSolverResult, SOLVER_NOT_ALL_NODES_VISITED, SOLVER_OK,
    SOLVER_POTENTIAL_SOFTLOCK,
};
pub use state::SearchState;
